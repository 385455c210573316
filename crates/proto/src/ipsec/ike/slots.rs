//! Wait slots for blocking negotiation requests
//!
//! A caller that wants to wait for its SAs reserves a slot before the
//! exchange starts. The engine signals the slot when the exchange completes
//! or fails; the caller waits on the receiver with its own timeout.

use tokio::sync::oneshot;

use crate::ipsec::{Error, Result};

#[derive(Debug)]
struct Slot {
    msg_id: u32,
    sender: oneshot::Sender<Result<()>>,
}

/// Fixed number of wait slots
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<Option<Slot>>,
}

impl SlotTable {
    /// Table with `capacity` slots
    pub fn new(capacity: usize) -> Self {
        SlotTable {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Whether a slot is free
    pub fn has_free(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    /// Number of slots in use
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Reserve a slot for the exchange `msg_id`
    ///
    /// # Errors
    ///
    /// Returns `Error::TooManyBlockingExchanges` if every slot is taken.
    pub fn reserve(&mut self, msg_id: u32) -> Result<(usize, oneshot::Receiver<Result<()>>)> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::TooManyBlockingExchanges)?;
        let (sender, receiver) = oneshot::channel();
        self.slots[index] = Some(Slot { msg_id, sender });
        Ok((index, receiver))
    }

    /// Wake the caller waiting on `slot` and free the slot
    ///
    /// Returns the message id the slot was reserved for.
    pub fn signal(&mut self, slot: usize, result: Result<()>) -> Option<u32> {
        let entry = self.slots.get_mut(slot)?.take()?;
        // the caller may have timed out already
        let _ = entry.sender.send(result);
        Some(entry.msg_id)
    }

    /// Free a slot reserved for `msg_id` without waking anyone
    pub fn release(&mut self, slot: usize, msg_id: u32) {
        if let Some(entry) = self.slots.get_mut(slot) {
            if entry.as_ref().map_or(false, |s| s.msg_id == msg_id) {
                *entry = None;
            }
        }
    }

    /// Wake every waiting caller with `error`
    pub fn fail_all(&mut self, error: &Error) {
        for index in 0..self.slots.len() {
            self.signal(index, Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_until_full() {
        let mut table = SlotTable::new(2);
        let (a, _ra) = table.reserve(1).unwrap();
        let (b, _rb) = table.reserve(2).unwrap();
        assert_ne!(a, b);
        assert!(!table.has_free());
        assert_eq!(table.reserve(3).unwrap_err(), Error::TooManyBlockingExchanges);

        // reserved for another exchange
        table.release(a, 2);
        assert_eq!(table.in_use(), 2);
        table.release(a, 1);
        assert_eq!(table.in_use(), 1);
        assert!(table.reserve(3).is_ok());
    }

    #[tokio::test]
    async fn test_signal_wakes_waiter() {
        let mut table = SlotTable::new(1);
        let (slot, receiver) = table.reserve(7).unwrap();
        assert_eq!(table.signal(slot, Err(Error::Timeout)), Some(7));
        assert_eq!(receiver.await.unwrap(), Err(Error::Timeout));
        assert!(table.has_free());
        assert_eq!(table.signal(slot, Ok(())), None);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let mut table = SlotTable::new(3);
        let (_, r1) = table.reserve(1).unwrap();
        let (_, r2) = table.reserve(2).unwrap();
        table.fail_all(&Error::InvalidState("stopped".into()));
        assert!(r1.await.unwrap().is_err());
        assert!(r2.await.unwrap().is_err());
        assert_eq!(table.in_use(), 0);
    }
}
