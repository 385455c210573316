//! Informational exchange
//!
//! Notifications and deletes are sent in one-way messages. Under an
//! established ISAKMP SA they are encrypted and start with HASH(1); before
//! that only clear notifications can be sent.

use subtle::ConstantTimeEq;

use super::constants::*;
use super::handle::{open, seal, Cipher, Env};
use super::header::IsakmpHeader;
use super::oakley::{exchange_iv, message_hash};
use super::payload::{join_payloads, DeletePayload, Message, NotifyPayload, RawPayload};
use super::sadb::IsakmpSa;
use crate::ipsec::{Error, Result};

/// Content of an informational message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoItem {
    /// Notification
    Notify(NotifyPayload),
    /// Delete
    Delete(DeletePayload),
}

impl InfoItem {
    fn to_raw(&self) -> Result<RawPayload> {
        Ok(match self {
            InfoItem::Notify(n) => RawPayload::new(PayloadType::Notify, n.to_body()),
            InfoItem::Delete(d) => RawPayload::new(PayloadType::Delete, d.to_body()?),
        })
    }
}

/// Build an encrypted informational message under `sa`
///
/// Each message gets its own message id and IV; the phase 1 IV chain is
/// left untouched.
pub fn build(env: &Env<'_>, sa: &IsakmpSa, items: &[InfoItem]) -> Result<Vec<u8>> {
    if items.is_empty() {
        return Err(Error::InvalidParameter("empty informational message".into()));
    }
    let msg_id = env.message_id();
    let prf = sa.proposal.hash;
    let iv = exchange_iv(prf, sa.proposal.encryption, &sa.last_block, msg_id);

    let rest = items.iter().map(InfoItem::to_raw).collect::<Result<Vec<_>>>()?;
    let hash = message_hash(prf, &sa.keys.skeyid_a, msg_id, &join_payloads(&rest)?.1);
    let mut message = Message::new(IsakmpHeader::new(
        sa.cookie_i,
        sa.cookie_r,
        ExchangeType::Informational,
        msg_id,
    ));
    message.push(PayloadType::Hash, hash);
    message.payloads.extend(rest);

    let cipher = Cipher {
        encryption: sa.proposal.encryption,
        key: &sa.keys.encryption_key,
        iv: &iv,
    };
    Ok(seal(env.provider, &mut message, Some(cipher))?.0)
}

/// Build a clear notification for an exchange without keys
pub fn build_plain(
    cookie_i: [u8; COOKIE_LEN],
    cookie_r: [u8; COOKIE_LEN],
    notify: &NotifyPayload,
) -> Result<Vec<u8>> {
    let mut message = Message::new(IsakmpHeader::new(
        cookie_i,
        cookie_r,
        ExchangeType::Informational,
        0,
    ));
    message.push(PayloadType::Notify, notify.to_body());
    message.to_plain_bytes()
}

/// Parse an informational message
///
/// Encrypted messages need the ISAKMP SA named by their cookies and are
/// authenticated; clear ones may only carry notifications.
pub fn parse(
    env: &Env<'_>,
    sa: Option<&IsakmpSa>,
    header: &IsakmpHeader,
    data: &[u8],
) -> Result<Vec<InfoItem>> {
    if header.exchange_type != ExchangeType::Informational {
        return Err(Error::UnexpectedMessage);
    }

    let message = match (header.is_encrypted(), sa) {
        (true, Some(sa)) => {
            let iv = exchange_iv(
                sa.proposal.hash,
                sa.proposal.encryption,
                &sa.last_block,
                header.message_id,
            );
            let cipher = Cipher {
                encryption: sa.proposal.encryption,
                key: &sa.keys.encryption_key,
                iv: &iv,
            };
            let (message, _) = open(env.provider, header, data, Some(cipher), true)?;
            message.check_payloads(
                &[PayloadType::Hash, PayloadType::Notify, PayloadType::Delete],
                &[PayloadType::Notify, PayloadType::Delete],
            )?;
            let received = match message.payloads.first() {
                Some(first) if first.kind == PayloadType::Hash => first.body.as_slice(),
                _ => return Err(Error::MissingPayload("HASH")),
            };
            let expected = message_hash(
                sa.proposal.hash,
                &sa.keys.skeyid_a,
                header.message_id,
                &message.bytes_after_first()?,
            );
            if !bool::from(expected.ct_eq(received)) {
                return Err(Error::VerifyFailed);
            }
            message
        }
        (true, None) => return Err(Error::UnexpectedMessage),
        (false, _) => {
            let (message, _) = open(env.provider, header, data, None, false)?;
            message.check_payloads(&[PayloadType::Notify], &[PayloadType::Notify])?;
            message
        }
    };

    message
        .payloads
        .iter()
        .filter(|p| p.kind != PayloadType::Hash && p.kind != PayloadType::VendorId)
        .map(|p| match p.kind {
            PayloadType::Delete => Ok(InfoItem::Delete(DeletePayload::from_body(&p.body)?)),
            _ => Ok(InfoItem::Notify(NotifyPayload::from_body(&p.body)?)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::config::IkeConfig;
    use crate::ipsec::crypto::SoftwareCrypto;
    use crate::ipsec::ike::sadb::tests::sample_sa;

    fn env_parts() -> (IkeConfig, SoftwareCrypto) {
        (IkeConfig::default(), SoftwareCrypto::new())
    }

    #[test]
    fn test_encrypted_delete_and_notify() {
        let (config, provider) = env_parts();
        let env = Env {
            config: &config,
            provider: &provider,
        };
        let sender = sample_sa(1, "10.0.0.2");
        let receiver = sample_sa(1, "10.0.0.1");
        let items = vec![
            InfoItem::Delete(DeletePayload::ipsec(protocol::ESP, &[300, 301])),
            InfoItem::Notify(NotifyPayload::new(
                protocol::ISAKMP,
                NotifyType::InitialContact,
                [sender.cookie_i, sender.cookie_r].concat(),
            )),
        ];
        let data = build(&env, &sender, &items).unwrap();
        let header = IsakmpHeader::from_bytes(&data).unwrap();
        assert!(header.is_encrypted());
        assert_ne!(header.message_id, 0);
        assert_eq!(parse(&env, Some(&receiver), &header, &data).unwrap(), items);

        // unknown SA
        assert_eq!(
            parse(&env, None, &header, &data).unwrap_err(),
            Error::UnexpectedMessage
        );
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let (config, provider) = env_parts();
        let env = Env {
            config: &config,
            provider: &provider,
        };
        let sender = sample_sa(1, "10.0.0.2");
        let mut receiver = sample_sa(1, "10.0.0.1");
        receiver.keys.skeyid_a = vec![7; 20];
        let items = [InfoItem::Delete(DeletePayload::ipsec(protocol::AH, &[300]))];
        let data = build(&env, &sender, &items).unwrap();
        let header = IsakmpHeader::from_bytes(&data).unwrap();
        assert_eq!(
            parse(&env, Some(&receiver), &header, &data).unwrap_err(),
            Error::VerifyFailed
        );
    }

    #[test]
    fn test_plain_notification() {
        let (config, provider) = env_parts();
        let env = Env {
            config: &config,
            provider: &provider,
        };
        let notify = NotifyPayload::new(protocol::ISAKMP, NotifyType::NoProposalChosen, Vec::new());
        let data = build_plain([1; 8], [2; 8], &notify).unwrap();
        let header = IsakmpHeader::from_bytes(&data).unwrap();
        assert_eq!(header.message_id, 0);
        assert_eq!(
            parse(&env, None, &header, &data).unwrap(),
            vec![InfoItem::Notify(notify)]
        );
    }

    #[test]
    fn test_plain_delete_rejected() {
        let (config, provider) = env_parts();
        let env = Env {
            config: &config,
            provider: &provider,
        };
        let mut message = Message::new(IsakmpHeader::new(
            [1; 8],
            [2; 8],
            ExchangeType::Informational,
            0,
        ));
        let delete = DeletePayload::ipsec(protocol::ESP, &[300]);
        message.push(PayloadType::Delete, delete.to_body().unwrap());
        let data = message.to_plain_bytes().unwrap();
        let header = IsakmpHeader::from_bytes(&data).unwrap();
        assert_eq!(
            parse(&env, None, &header, &data).unwrap_err(),
            Error::UnexpectedPayload(PayloadType::Delete.to_u8())
        );
    }
}
