// crates/charla-protocol/tests/packet_codec.rs
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use charla_protocol::{
    recv_packet, send_packet, PacketHeader, PacketType, ProtocolError, Stage, HEADER_LEN,
    MAX_PAYLOAD_LEN,
};
use tokio::io::{duplex, AsyncWrite, AsyncWriteExt};

/// Writer that accepts at most `chunk` bytes per call, or nothing at all
/// once `budget` is exhausted.
struct TrickleWriter {
    out: Vec<u8>,
    chunk: usize,
    budget: usize,
}

impl AsyncWrite for TrickleWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = buf.len().min(self.chunk).min(self.budget);
        self.budget -= n;
        self.out.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn packet_round_trips_over_a_stream() {
    let (mut client, mut server) = duplex(1024);
    let body = b"bob\r\nhello there";
    let header = PacketHeader::new(PacketType::Send, 42, body.len() as u32);

    send_packet(&mut client, &header, body).await.unwrap();
    let (got, payload) = recv_packet(&mut server).await.unwrap();

    assert_eq!(got.kind(), Some(PacketType::Send));
    assert_eq!(got.msgid, 42);
    assert_eq!(got.payload_length as usize, body.len());
    assert_eq!(payload.as_deref(), Some(&body[..]));
    assert_eq!(got.to_bytes(), header.to_bytes());
}

#[tokio::test]
async fn empty_payload_is_reported_as_absent() {
    let (mut client, mut server) = duplex(64);
    send_packet(&mut client, &PacketHeader::empty(PacketType::Nack, 7), &[])
        .await
        .unwrap();

    let (got, payload) = recv_packet(&mut server).await.unwrap();
    assert_eq!(got.kind(), Some(PacketType::Nack));
    assert_eq!(got.msgid, 7);
    assert!(payload.is_none());
}

#[tokio::test]
async fn partial_transfers_are_accumulated() {
    // A 4-byte pipe forces every read and write to be split.
    let (mut client, mut server) = duplex(4);
    let body: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    let header = PacketHeader::new(PacketType::Mesg, 9, body.len() as u32);

    let (sent, received) = tokio::join!(
        send_packet(&mut client, &header, &body),
        recv_packet(&mut server)
    );

    sent.unwrap();
    let (got, payload) = received.unwrap();
    assert_eq!(got, header);
    assert_eq!(payload.unwrap().as_ref(), body.as_slice());
}

#[tokio::test]
async fn trickling_writer_still_receives_the_full_packet() {
    let mut writer = TrickleWriter {
        out: Vec::new(),
        chunk: 3,
        budget: usize::MAX,
    };
    let header = PacketHeader::new(PacketType::Ack, 1, 5);

    send_packet(&mut writer, &header, b"hello").await.unwrap();

    assert_eq!(&writer.out[..HEADER_LEN], &header.to_bytes());
    assert_eq!(&writer.out[HEADER_LEN..], b"hello");
}

#[tokio::test]
async fn zero_length_write_is_a_short_count() {
    let mut writer = TrickleWriter {
        out: Vec::new(),
        chunk: 4,
        budget: HEADER_LEN + 2,
    };
    let header = PacketHeader::new(PacketType::Mesg, 1, 5);

    let err = send_packet(&mut writer, &header, b"hello").await.unwrap_err();
    match err {
        ProtocolError::ShortCount {
            stage,
            expected,
            transferred,
        } => {
            assert_eq!(stage, Stage::Payload);
            assert_eq!(expected, 5);
            assert_eq!(transferred, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn truncated_payload_fails_without_delivering_data() {
    let (mut client, mut server) = duplex(256);
    let header = PacketHeader::new(PacketType::Send, 3, 100);
    client.write_all(&header.to_bytes()).await.unwrap();
    client.write_all(&[b'x'; 40]).await.unwrap();
    drop(client);

    let err = recv_packet(&mut server).await.unwrap_err();
    match err {
        ProtocolError::ShortCount {
            stage,
            expected,
            transferred,
        } => {
            assert_eq!(stage, Stage::Payload);
            assert_eq!(expected, 100);
            assert_eq!(transferred, 40);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn truncated_header_fails() {
    let (mut client, mut server) = duplex(64);
    client.write_all(&[1, 0, 0, 0, 1]).await.unwrap();
    drop(client);

    let err = recv_packet(&mut server).await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::ShortCount {
            stage: Stage::Header,
            expected: HEADER_LEN,
            transferred: 5,
        }
    ));
}

#[tokio::test]
async fn eof_before_any_byte_is_a_short_header() {
    let (client, mut server) = duplex(64);
    drop(client);

    let err = recv_packet(&mut server).await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::ShortCount {
            stage: Stage::Header,
            transferred: 0,
            ..
        }
    ));
}

#[tokio::test]
async fn oversized_payload_is_refused() {
    let (mut client, mut server) = duplex(64);
    let header = PacketHeader::new(PacketType::Send, 1, MAX_PAYLOAD_LEN + 1);
    client.write_all(&header.to_bytes()).await.unwrap();

    let err = recv_packet(&mut server).await.unwrap_err();
    assert!(matches!(err, ProtocolError::PayloadTooLarge(len) if len == MAX_PAYLOAD_LEN + 1));
}

#[tokio::test]
async fn oversized_send_writes_nothing() {
    let mut writer = TrickleWriter {
        out: Vec::new(),
        chunk: 4096,
        budget: usize::MAX,
    };
    let body = vec![0u8; MAX_PAYLOAD_LEN as usize + 1];
    let header = PacketHeader::new(PacketType::Mesg, 1, body.len() as u32);

    let err = send_packet(&mut writer, &header, &body).await.unwrap_err();
    assert!(matches!(err, ProtocolError::PayloadTooLarge(len) if len == MAX_PAYLOAD_LEN + 1));
    assert!(writer.out.is_empty());
}

#[tokio::test]
async fn payload_at_the_limit_round_trips() {
    let body = vec![7u8; MAX_PAYLOAD_LEN as usize];
    let header = PacketHeader::new(PacketType::Mesg, 2, MAX_PAYLOAD_LEN);
    let (mut client, mut server) = duplex(64 * 1024);

    let (sent, received) = tokio::join!(
        send_packet(&mut client, &header, &body),
        recv_packet(&mut server)
    );
    sent.unwrap();
    let (got, payload) = received.unwrap();
    assert_eq!(got, header);
    assert_eq!(payload.map(|p| p.len()), Some(MAX_PAYLOAD_LEN as usize));
}

#[tokio::test]
async fn mismatched_length_writes_nothing() {
    let mut writer = TrickleWriter {
        out: Vec::new(),
        chunk: 64,
        budget: usize::MAX,
    };
    let header = PacketHeader::new(PacketType::Ack, 1, 10);

    let err = send_packet(&mut writer, &header, b"short").await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::LengthMismatch {
            declared: 10,
            actual: 5
        }
    ));
    assert!(writer.out.is_empty());
}

#[tokio::test]
async fn unknown_packet_types_pass_through() {
    let (mut client, mut server) = duplex(64);
    let header = PacketHeader {
        packet_type: 77,
        msgid: 5,
        payload_length: 2,
    };
    send_packet(&mut client, &header, b"ok").await.unwrap();

    let (got, payload) = recv_packet(&mut server).await.unwrap();
    assert_eq!(got, header);
    assert_eq!(got.kind(), None);
    assert_eq!(payload.as_deref(), Some(&b"ok"[..]));
}
