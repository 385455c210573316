//! Sorted-by-name container
//!
//! Policy groups in both the IPsec and IKE databases are kept sorted by
//! name so that a lookup can stop as soon as it walks past the position
//! where the name would have been.

use std::cmp::Ordering;

use crate::{StrataError, StrataResult};

/// An entry that is identified and ordered by its name
pub trait Named {
    /// Entry name (sort key)
    fn name(&self) -> &str;
}

/// Vector of entries kept in ascending name order
#[derive(Debug, Clone)]
pub struct SortedList<T> {
    items: Vec<T>,
}

impl<T> Default for SortedList<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Named> SortedList<T> {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Linear search with early termination.
    ///
    /// Returns `Ok(index)` when found, `Err(index)` with the insertion point
    /// otherwise.
    fn search(&self, name: &str) -> Result<usize, usize> {
        for (i, item) in self.items.iter().enumerate() {
            match name.cmp(item.name()) {
                Ordering::Equal => return Ok(i),
                // every following entry sorts even higher
                Ordering::Less => return Err(i),
                Ordering::Greater => {}
            }
        }
        Err(self.items.len())
    }

    /// Insert an entry at its sorted position
    ///
    /// # Errors
    ///
    /// Returns `StrataError::Duplicate` if an entry with the same name exists
    pub fn insert(&mut self, item: T) -> StrataResult<()> {
        match self.search(item.name()) {
            Ok(_) => Err(StrataError::Duplicate(item.name().to_string())),
            Err(pos) => {
                self.items.insert(pos, item);
                Ok(())
            }
        }
    }

    /// Look up an entry by name
    pub fn get(&self, name: &str) -> Option<&T> {
        self.search(name).ok().map(|i| &self.items[i])
    }

    /// Look up an entry by name for modification
    pub fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        match self.search(name) {
            Ok(i) => Some(&mut self.items[i]),
            Err(_) => None,
        }
    }

    /// Remove an entry by name, returning it
    pub fn remove(&mut self, name: &str) -> Option<T> {
        self.search(name).ok().map(|i| self.items.remove(i))
    }

    /// First entry matching a predicate, in name order
    pub fn find<P>(&self, mut predicate: P) -> Option<&T>
    where
        P: FnMut(&T) -> bool,
    {
        self.items.iter().find(|item| predicate(item))
    }

    /// First entry matching a predicate, for modification
    pub fn find_mut<P>(&mut self, mut predicate: P) -> Option<&mut T>
    where
        P: FnMut(&T) -> bool,
    {
        self.items.iter_mut().find(|item| predicate(item))
    }

    /// Iterate in name order
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Iterate mutably in name order
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
