//! Headless player client exercising the full protocol path: front
//! assignment through quorum, section feed, ordered update application
//! with cumulative acks, keepalive replies, and a scripted command burst
//! with RTT-based retransmission.

use clap::Parser;
use rand::distributions::Alphanumeric;
use rand::Rng;
use shared::channel::{RecvChannel, ResendQueue, RttEstimate, SendChannel};
use shared::config::ClusterConfig;
use shared::coord::{self, Request, Response};
use shared::protocol::{self, Command, Datagram, MAX_DATAGRAM};
use shared::world::{Object, ObjectId, PlayerId, SectionSnapshot};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::interval;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Which configured player to connect as
    #[arg(short, long, default_value = "1")]
    player: PlayerId,

    /// Cluster configuration file (JSON); defaults to the built-in layout
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of scripted commands to send before quitting
    #[arg(short = 'n', long, default_value = "6")]
    commands: u64,
}

/// Stand-in for the real login service: an opaque session token.
fn login_blackbox() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

fn describe(id: ObjectId, object: &Object) {
    if object.speed == 0.0 {
        println!(
            "\"{}\" [#{}] at {:?} (stationary)",
            object.name, id, object.loc
        );
    } else {
        println!(
            "\"{}\" [#{}] at {:?}, heading {} deg at speed {}",
            object.name, id, object.loc, object.direction, object.speed
        );
    }
}

async fn fetch_feed(
    front: SocketAddr,
    player: PlayerId,
    session: &str,
    timeout: Duration,
) -> Option<SectionSnapshot> {
    let response = coord::try_call(
        front,
        &Request::SectionFeed {
            player,
            session: session.to_string(),
        },
        timeout,
    )
    .await;
    match response {
        Response::Section(snapshot) => Some(snapshot),
        other => {
            println!("no section feed from {}: {:?}", front, other);
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ClusterConfig::load(path)?,
        None => ClusterConfig::default(),
    };

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("client socket bound to {}", socket.local_addr()?);

    let session = login_blackbox();
    let response = coord::try_call(
        config.quorum_addr,
        &Request::AssignFront {
            player: args.player,
            addr: socket.local_addr()?,
            session: session.clone(),
        },
        config.call_timeout,
    )
    .await;
    let Response::Front(mut front) = response else {
        return Err(format!("no front available: {:?}", response).into());
    };
    println!("got front {}", front);

    let Some(snapshot) = fetch_feed(front, args.player, &session, config.call_timeout).await
    else {
        return Err("front refused the section feed".into());
    };
    println!("you are in {} (version {})", snapshot.name, snapshot.version);
    for (id, object) in &snapshot.objects {
        describe(*id, object);
    }

    let mut updates: RecvChannel<(ObjectId, Option<Object>)> =
        RecvChannel::with_base(snapshot.version);
    let mut commands: SendChannel<Vec<u8>> = SendChannel::new();
    let mut resend: ResendQueue<u64> = ResendQueue::new();
    let mut rtt = RttEstimate::new(config.player_initial_rtt);

    let script = [
        Command::SetSpeed(1),
        Command::SetDirection(90),
        Command::Nop,
        Command::SetDirection(180),
        Command::SetSpeed(0),
    ];

    let mut command_timer = interval(Duration::from_secs(1));
    let mut sent = 0u64;
    let mut buffer = [0u8; MAX_DATAGRAM];
    let mut last_front_msg = Instant::now();

    loop {
        let resend_at = resend
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(1));

        tokio::select! {
            result = socket.recv_from(&mut buffer) => {
                let Ok((len, addr)) = result else { continue };
                let Ok(datagram) = protocol::decode(&buffer[..len]) else { continue };
                last_front_msg = Instant::now();
                match datagram {
                    Datagram::Ping { rtt_ms, timestamp_ms } => {
                        rtt.update(Duration::from_millis(rtt_ms));
                        let pong = Datagram::Pong { timestamp_ms };
                        protocol::send_datagram(&socket, &pong, addr, 0).await?;
                    }
                    Datagram::Update { version, object_id, object } => {
                        for (applied, (id, object)) in updates.accept(version, (object_id, object)) {
                            match object {
                                Some(object) => {
                                    print!("[v{}] ", applied);
                                    describe(id, &object);
                                }
                                None => println!("[v{}] object #{} left the section", applied, id),
                            }
                        }
                        let ack = Datagram::Ack { ack: updates.cumulative_ack() };
                        protocol::send_datagram(&socket, &ack, addr, 0).await?;
                    }
                    Datagram::Ack { ack } => {
                        if let Some((seq, bytes)) = commands.on_ack(ack) {
                            socket.send_to(&bytes, front).await?;
                            resend.push(Instant::now() + rtt.resend_delay(), seq);
                        }
                    }
                    Datagram::Redirect { front: new_front } => {
                        println!("redirected to front {}", new_front);
                        front = new_front;
                        commands = SendChannel::new();
                        resend = ResendQueue::new();
                        if let Some(snapshot) =
                            fetch_feed(front, args.player, &session, config.call_timeout).await
                        {
                            println!("you are in {} (version {})", snapshot.name, snapshot.version);
                            updates = RecvChannel::with_base(snapshot.version);
                        }
                    }
                    Datagram::WrongFront => {
                        println!("wrong front, asking quorum again");
                        let response = coord::try_call(
                            config.quorum_addr,
                            &Request::AssignFront {
                                player: args.player,
                                addr: socket.local_addr()?,
                                session: session.clone(),
                            },
                            config.call_timeout,
                        )
                        .await;
                        if let Response::Front(new_front) = response {
                            front = new_front;
                            commands = SendChannel::new();
                            resend = ResendQueue::new();
                            if let Some(snapshot) =
                                fetch_feed(front, args.player, &session, config.call_timeout).await
                            {
                                updates = RecvChannel::with_base(snapshot.version);
                            }
                        }
                    }
                    _ => {}
                }
            },

            _ = command_timer.tick() => {
                // A silent front has probably died; its sections will have
                // moved, so ask quorum where to go.
                if last_front_msg.elapsed() > config.front_timeout {
                    println!("lost front to timeout, asking quorum again");
                    let response = coord::try_call(
                        config.quorum_addr,
                        &Request::AssignFront {
                            player: args.player,
                            addr: socket.local_addr()?,
                            session: session.clone(),
                        },
                        config.call_timeout,
                    )
                    .await;
                    if let Response::Front(new_front) = response {
                        front = new_front;
                        commands = SendChannel::new();
                        resend = ResendQueue::new();
                        last_front_msg = Instant::now();
                        if let Some(snapshot) =
                            fetch_feed(front, args.player, &session, config.call_timeout).await
                        {
                            updates = RecvChannel::with_base(snapshot.version);
                        }
                    }
                    continue;
                }
                if sent >= args.commands {
                    println!("script finished, quitting");
                    protocol::send_datagram(&socket, &Datagram::Quit, front, 0).await?;
                    break;
                }
                let command = script[(sent as usize) % script.len()];
                let sequence = commands.next_seq();
                let datagram = Datagram::Command { sequence, command };
                let bytes = bincode::serialize(&datagram)?;
                println!("sending {:?} as sequence {}", command, sequence);
                socket.send_to(&bytes, front).await?;
                commands.push(bytes);
                resend.push(Instant::now() + rtt.resend_delay(), sequence);
                sent += 1;
            },

            _ = tokio::time::sleep_until(resend_at.into()) => {
                let now = Instant::now();
                while let Some(sequence) = resend.pop_due(now) {
                    if let Some(bytes) = commands.payload(sequence) {
                        println!("resending sequence {}", sequence);
                        socket.send_to(bytes, front).await?;
                        resend.push(now + rtt.resend_delay(), sequence);
                    }
                }
            },
        }
    }

    Ok(())
}
