//! Per-connection service loop.
//!
//! Reads packets until EOF, a transport error, or a shutdown request,
//! dispatching each one:
//!
//! - `LOGIN`  (payload: handle)             => ACK + start delivery, or NACK
//! - `LOGOUT`                               => ACK then log out, or NACK
//! - `USERS`                                => ACK with `handle\r\n` per user
//! - `SEND`   (payload: `recipient\r\nbody`) => ACK once queued, or NACK
//! - anything else                          => NACK
//!
//! Replies only reach logged-in sessions; replies to anonymous sessions
//! are dropped and logged. On exit the session is logged out, its
//! connection closed and the client unregistered.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use charla_core::{ChatError, Client};
use charla_protocol::{
    recv_packet, PacketHeader, PacketType, ProtocolError, Stage, MAX_PAYLOAD_LEN,
};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::delivery::{install_bounce_hook, run_delivery};

/// Run the service loop for a single connection.
pub(crate) async fn serve<R>(ctx: Arc<ServerContext>, client: Arc<Client>, mut reader: R)
where
    R: AsyncRead + Unpin + Send,
{
    debug!(client = %client.id(), "service started");

    loop {
        let received = tokio::select! {
            biased;
            _ = client.wait_shutdown() => {
                debug!(client = %client.id(), "service shutting down");
                break;
            }
            res = recv_packet(&mut reader) => res,
        };

        let (header, payload) = match received {
            Ok(packet) => packet,
            Err(ProtocolError::ShortCount {
                stage: Stage::Header,
                transferred: 0,
                ..
            }) => {
                info!(client = %client.id(), "client disconnected");
                break;
            }
            Err(e) => {
                warn!(client = %client.id(), error = %e, "receive failed");
                break;
            }
        };

        match dispatch(&ctx, &client, header, payload).await {
            Ok(()) => {}
            Err(ChatError::NotLoggedIn) => {
                warn!(
                    client = %client.id(),
                    msgid = header.msgid,
                    "dropping reply to anonymous session"
                );
            }
            Err(e) => {
                warn!(client = %client.id(), error = %e, "send failed");
                break;
            }
        }
    }

    teardown(&ctx, &client).await;
}

async fn dispatch(
    ctx: &ServerContext,
    client: &Arc<Client>,
    header: PacketHeader,
    payload: Option<Bytes>,
) -> Result<(), ChatError> {
    let msgid = header.msgid;
    let payload = payload.as_deref().unwrap_or(&[]);

    match header.kind() {
        Some(PacketType::Login) => handle_login(ctx, client, msgid, payload).await,
        Some(PacketType::Logout) => handle_logout(ctx, client, msgid).await,
        Some(PacketType::Users) => handle_users(ctx, client, msgid).await,
        Some(PacketType::Send) => handle_send(ctx, client, msgid, payload).await,
        _ => {
            debug!(
                client = %client.id(),
                packet_type = header.packet_type,
                "unsupported packet"
            );
            client.send_nack(msgid).await
        }
    }
}

async fn handle_login(
    ctx: &ServerContext,
    client: &Arc<Client>,
    msgid: u32,
    payload: &[u8],
) -> Result<(), ChatError> {
    let Some(handle) = parse_handle(payload) else {
        debug!(client = %client.id(), "malformed handle");
        return client.send_nack(msgid).await;
    };

    match client.login(handle, &ctx.users, ctx.mailboxes.as_ref()).await {
        Ok(mailbox) => {
            install_bounce_hook(&mailbox);
            client.send_ack(msgid, &[]).await?;
            tokio::spawn(run_delivery(Arc::clone(client), mailbox));
            Ok(())
        }
        Err(e) => {
            info!(client = %client.id(), handle, error = %e, "login refused");
            client.send_nack(msgid).await
        }
    }
}

async fn handle_logout(ctx: &ServerContext, client: &Client, msgid: u32) -> Result<(), ChatError> {
    if !client.is_logged_in() {
        return client.send_nack(msgid).await;
    }

    // Acknowledge first: once logged out the session can no longer be sent to.
    let acked = client.send_ack(msgid, &[]).await;
    client.logout(&ctx.users).await?;
    acked
}

async fn handle_users(ctx: &ServerContext, client: &Client, msgid: u32) -> Result<(), ChatError> {
    let mut listing = BytesMut::new();
    for handle in ctx.users.handles() {
        listing.put_slice(handle.as_bytes());
        listing.put_slice(b"\r\n");
    }
    client.send_ack(msgid, &listing).await
}

async fn handle_send(
    ctx: &ServerContext,
    client: &Client,
    msgid: u32,
    payload: &[u8],
) -> Result<(), ChatError> {
    let Some(sender) = client.mailbox() else {
        return client.send_nack(msgid).await;
    };
    let Some((recipient, body)) = split_send_payload(payload) else {
        return client.send_nack(msgid).await;
    };

    let target = ctx
        .clients
        .snapshot_all()
        .into_iter()
        .find_map(|c| c.mailbox().filter(|mb| mb.handle() == recipient));
    let Some(target) = target else {
        debug!(client = %client.id(), recipient, "no such recipient");
        return client.send_nack(msgid).await;
    };

    let Some(message) = compose_message(sender.handle(), body) else {
        debug!(client = %client.id(), recipient, msgid, "message too large to deliver");
        return client.send_nack(msgid).await;
    };

    // From here on the outcome is reported to the sender as RCVD or BOUNCE.
    if !target.add_message(msgid, sender, message) {
        debug!(client = %client.id(), recipient, msgid, "recipient mailbox defunct");
    }
    client.send_ack(msgid, &[]).await
}

/// A login handle: non-empty UTF-8 without line breaks, since handles are
/// framed by `\r\n` in `USERS` listings and `SEND` payloads.
fn parse_handle(payload: &[u8]) -> Option<&str> {
    let handle = std::str::from_utf8(payload).ok()?;
    if handle.is_empty() || handle.contains(&['\r', '\n'][..]) {
        return None;
    }
    Some(handle)
}

/// Build the `sender\r\nbody` payload of a `MESG`, or `None` if it would
/// not fit in one packet.
fn compose_message(sender: &str, body: &[u8]) -> Option<Bytes> {
    let len = sender.len() + 2 + body.len();
    if len > MAX_PAYLOAD_LEN as usize {
        return None;
    }

    let mut message = BytesMut::with_capacity(len);
    message.put_slice(sender.as_bytes());
    message.put_slice(b"\r\n");
    message.put_slice(body);
    Some(message.freeze())
}

/// Split a `SEND` payload into recipient handle and message body.
fn split_send_payload(payload: &[u8]) -> Option<(&str, &[u8])> {
    let pos = payload.windows(2).position(|w| w == b"\r\n")?;
    let recipient = std::str::from_utf8(&payload[..pos]).ok()?;
    if recipient.is_empty() {
        return None;
    }
    Some((recipient, &payload[pos + 2..]))
}

async fn teardown(ctx: &ServerContext, client: &Client) {
    // Unblocks a delivery task stuck writing to this connection.
    client.shutdown();

    match client.logout(&ctx.users).await {
        Ok(()) | Err(ChatError::NotLoggedIn) => {}
        Err(e) => warn!(client = %client.id(), error = %e, "logout during teardown failed"),
    }

    client.close().await;

    if let Err(e) = ctx.clients.unregister(client) {
        warn!(client = %client.id(), error = %e, "unregister failed");
    }
    info!(client = %client.id(), "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_payload_splits_on_first_crlf() {
        let (to, body) = split_send_payload(b"bob\r\nhi\r\nthere").unwrap();
        assert_eq!(to, "bob");
        assert_eq!(body, b"hi\r\nthere");
    }

    #[test]
    fn send_payload_needs_recipient_and_separator() {
        assert!(split_send_payload(b"bob hi").is_none());
        assert!(split_send_payload(b"\r\nhi").is_none());
        assert!(split_send_payload(&[0xff, b'\r', b'\n']).is_none());
    }

    #[test]
    fn handles_may_not_contain_line_breaks() {
        assert_eq!(parse_handle(b"alice"), Some("alice"));
        assert!(parse_handle(b"").is_none());
        assert!(parse_handle(b"mallory\r\nadmin").is_none());
        assert!(parse_handle(b"eve\n").is_none());
        assert!(parse_handle(b"eve\r").is_none());
        assert!(parse_handle(&[0xc3, 0x28]).is_none());
    }

    #[test]
    fn message_carries_sender_then_body() {
        let message = compose_message("alice", b"hi bob").unwrap();
        assert_eq!(&message[..], b"alice\r\nhi bob");
    }

    #[test]
    fn message_over_the_packet_limit_is_refused() {
        let limit = MAX_PAYLOAD_LEN as usize;
        let fits = vec![b'x'; limit - "bob".len() - 2];
        assert_eq!(compose_message("bob", &fits).map(|m| m.len()), Some(limit));

        let too_big = vec![b'x'; fits.len() + 1];
        assert!(compose_message("bob", &too_big).is_none());
    }

    #[test]
    fn empty_body_is_allowed() {
        let (to, body) = split_send_payload(b"bob\r\n").unwrap();
        assert_eq!(to, "bob");
        assert!(body.is_empty());
    }
}
