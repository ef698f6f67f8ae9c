use std::env;
use std::error::Error;
use std::io::{self, Write};

use charla_protocol::{recv_packet, send_packet, PacketHeader, PacketType, ProtocolError, Stage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Where to connect: env override or default.
    let addr = env::var("CHARLA_CLIENT_ADDR").unwrap_or_else(|_| "127.0.0.1:9999".to_string());

    println!("Connecting to {}...", addr);
    let stream = TcpStream::connect(&addr).await?;
    println!("Connected.");
    println!("Commands:");
    println!("  login <handle>");
    println!("  users");
    println!("  send <handle> <message>");
    println!("  logout");
    println!("Type 'quit' or 'exit' to leave.\n");

    let (reader, mut writer) = stream.into_split();
    let printer = tokio::spawn(print_incoming(reader));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut msgid: u32 = 0;

    loop {
        print!(">> ");
        io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!("\nEOF on stdin, exiting client.");
            break;
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.eq_ignore_ascii_case("quit") || trimmed.eq_ignore_ascii_case("exit") {
            println!("Exiting client.");
            break;
        }

        let Some((kind, payload)) = parse_command(trimmed) else {
            eprintln!("Unknown command: {}", trimmed);
            continue;
        };

        msgid = msgid.wrapping_add(1);
        let header = PacketHeader::new(kind, msgid, payload.len() as u32);
        send_packet(&mut writer, &header, &payload).await?;
    }

    drop(writer);
    printer.abort();
    Ok(())
}

fn parse_command(line: &str) -> Option<(PacketType, Vec<u8>)> {
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    match cmd.to_ascii_lowercase().as_str() {
        "login" if !rest.trim().is_empty() => Some((PacketType::Login, rest.trim().as_bytes().to_vec())),
        "logout" => Some((PacketType::Logout, Vec::new())),
        "users" => Some((PacketType::Users, Vec::new())),
        "send" => {
            let (to, body) = rest.trim().split_once(' ')?;
            let mut payload = Vec::with_capacity(to.len() + 2 + body.len());
            payload.extend_from_slice(to.as_bytes());
            payload.extend_from_slice(b"\r\n");
            payload.extend_from_slice(body.as_bytes());
            Some((PacketType::Send, payload))
        }
        _ => None,
    }
}

async fn print_incoming(mut reader: OwnedReadHalf) {
    loop {
        match recv_packet(&mut reader).await {
            Ok((header, payload)) => {
                let kind = header
                    .kind()
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| format!("type {}", header.packet_type));
                let body = payload
                    .as_deref()
                    .map(|p| String::from_utf8_lossy(p).replace("\r\n", " | "))
                    .unwrap_or_default();
                println!("\n<< {} #{} {}", kind, header.msgid, body);
            }
            Err(ProtocolError::ShortCount {
                stage: Stage::Header,
                transferred: 0,
                ..
            }) => {
                println!("\nServer closed the connection.");
                return;
            }
            Err(e) => {
                eprintln!("\nRead error: {}", e);
                return;
            }
        }
    }
}
