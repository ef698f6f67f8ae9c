//! Mailbox delivery.
//!
//! One delivery task runs per login. It owns a reference to the session
//! and its mailbox and turns mailbox entries into packets:
//!
//! - `Message` => `MESG` to this client, then `RCVD` (or `BOUNCE` if the
//!   write failed) queued back to the sender.
//! - `Notice`  => `RCVD` / `BOUNCE` with an empty payload.
//!
//! The task ends when the mailbox is shut down (logout or disconnect).

use std::sync::Arc;

use charla_core::{Client, Mailbox, MailboxEntry, NoticeKind};
use charla_protocol::{PacketHeader, PacketType};
use tracing::debug;

/// Bounce every discarded message back to its sender.
pub(crate) fn install_bounce_hook(mailbox: &Mailbox) {
    mailbox.set_discard_hook(Some(Arc::new(|entry: &MailboxEntry| {
        if let MailboxEntry::Message { msgid, from, .. } = entry {
            from.add_notice(NoticeKind::Bounce, *msgid);
        }
    })));
}

/// Drain `mailbox` onto `client`'s connection until the mailbox shuts down.
pub(crate) async fn run_delivery(client: Arc<Client>, mailbox: Arc<Mailbox>) {
    debug!(client = %client.id(), handle = mailbox.handle(), "delivery started");

    while let Some(entry) = mailbox.next().await {
        match entry {
            MailboxEntry::Message { msgid, from, body } => {
                let delivered = match u32::try_from(body.len()) {
                    Ok(len) => {
                        let header = PacketHeader::new(PacketType::Mesg, msgid, len);
                        client.send_packet(&header, &body).await
                    }
                    Err(_) => Err(charla_protocol::ProtocolError::PayloadTooLarge(u32::MAX).into()),
                };

                match delivered {
                    Ok(()) => {
                        from.add_notice(NoticeKind::Received, msgid);
                    }
                    Err(e) => {
                        debug!(client = %client.id(), msgid, error = %e, "message bounced");
                        from.add_notice(NoticeKind::Bounce, msgid);
                    }
                }
            }
            MailboxEntry::Notice { kind, msgid } => {
                let packet_type = match kind {
                    NoticeKind::Received => PacketType::Rcvd,
                    NoticeKind::Bounce => PacketType::Bounce,
                };
                let header = PacketHeader::empty(packet_type, msgid);
                if let Err(e) = client.send_packet(&header, &[]).await {
                    debug!(client = %client.id(), msgid, error = %e, "notice dropped");
                }
            }
        }
    }

    debug!(client = %client.id(), handle = mailbox.handle(), "delivery finished");
}
