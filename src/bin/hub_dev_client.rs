//! Interactive client for poking a running hub.
//!
//! ```text
//! hub_dev_client [--url ws://127.0.0.1:3000/ws] [--session ID] [--token T]
//! hub_dev_client --actuator --token T [--url ws://127.0.0.1:3000/actuator]
//! ```
//!
//! In client mode, stdin lines are turned into frames:
//! `activate 1`, `deactivate 1`, `accept 1`, `decline 1`,
//! `set 1 brightness=0.5 hueSet=2`, `trigger 1 sparkle`, `quit`.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_HOST: &str = "ws://127.0.0.1:3000";

struct Args {
    url: String,
    session: Option<String>,
    token: Option<String>,
    actuator: bool,
}

fn parse_args() -> Result<Args, Box<dyn std::error::Error>> {
    let mut url = None;
    let mut session = None;
    let mut token = None;
    let mut actuator = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--url" => url = Some(args.next().ok_or("missing value for --url")?),
            "--session" => session = Some(args.next().ok_or("missing value for --session")?),
            "--token" => token = Some(args.next().ok_or("missing value for --token")?),
            "--actuator" => actuator = true,
            other => return Err(format!("unknown argument: {other}").into()),
        }
    }

    let url = url.unwrap_or_else(|| {
        let path = if actuator { "actuator" } else { "ws" };
        format!("{DEFAULT_HOST}/{path}")
    });
    Ok(Args {
        url,
        session,
        token,
        actuator,
    })
}

fn build_url(args: &Args) -> String {
    let mut params = Vec::new();
    if let Some(session) = &args.session {
        params.push(format!("session={session}"));
    }
    if let Some(token) = &args.token {
        params.push(format!("token={token}"));
    }
    if params.is_empty() {
        args.url.clone()
    } else {
        let sep = if args.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", args.url, sep, params.join("&"))
    }
}

fn parse_command(line: &str) -> Result<Value, String> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().ok_or("empty line")?;
    let fixture = parts.next().ok_or("missing fixture id")?;

    let frame = match verb {
        "activate" => json!({"event": "activateSession", "data": fixture}),
        "deactivate" => json!({"event": "deactivateSession", "data": fixture}),
        "accept" => json!({"event": "acceptOfferedSession", "data": fixture}),
        "decline" => json!({"event": "declineOfferedSession", "data": fixture}),
        "set" => {
            let mut data = Map::new();
            data.insert("fixtureId".to_string(), json!(fixture));
            for pair in parts {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("expected key=value, got {pair}"))?;
                let value: f64 = value
                    .parse()
                    .map_err(|_| format!("{key} needs a number"))?;
                data.insert(key.to_string(), json!(value));
            }
            json!({"event": "updateSetting", "data": data})
        }
        "trigger" => {
            let name = parts.next().ok_or("missing triggerable name")?;
            json!({
                "event": "runOneShotTriggerable",
                "data": {"fixtureId": fixture, "triggerableName": name}
            })
        }
        other => return Err(format!("unknown command: {other}")),
    };
    Ok(frame)
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args()?;
    let url = build_url(&args);

    println!("hub-dev-client: connecting to {}", args.url);
    let (socket, _) = connect_async(url.as_str()).await?;
    println!("hub-dev-client: connected");
    let (mut sink, mut stream) = socket.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
    });

    if !args.actuator {
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "quit" {
                    std::process::exit(0);
                }
                match parse_command(line) {
                    Ok(frame) => {
                        println!("-> {frame}");
                        if out_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(err) => eprintln!("?? {err}"),
                }
            }
        });
    }

    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(text) => {
                let value: Value = serde_json::from_str(&text)?;
                match value.get("event").and_then(Value::as_str) {
                    Some(event) => println!(
                        "<- {} {}",
                        event,
                        value.get("data").cloned().unwrap_or(Value::Null)
                    ),
                    None => println!("<- {value}"),
                }
            }
            Message::Close(frame) => {
                println!("hub-dev-client: closed {frame:?}");
                break;
            }
            _ => {}
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    run().await
}
