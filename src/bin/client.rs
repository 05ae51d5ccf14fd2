use clap::Parser;
use futures::{SinkExt, StreamExt};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use quill_store::config::ServerConfig;
use quill_store::server::protocol::{ClientCodec, Command, Response};
use quill_store::utils::util::pretty_format_lines;

#[derive(Debug, Parser, PartialEq)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(short = 'a', long, help = "Server address")]
    addr: Option<String>,
    #[clap(short = 'c', long, help = "Run one query and exit")]
    command: Option<String>,
}

fn parse_line(line: &str) -> Command {
    match line.trim() {
        "begin" | "\\b" => Command::Begin,
        "commit" | "\\c" => Command::Commit,
        "rollback" | "\\r" => Command::Rollback,
        query => Command::Query(query.to_string()),
    }
}

fn print_response(response: Response) {
    match response {
        Response::Success(payload) => {
            let text = String::from_utf8_lossy(&payload);
            let lines: Vec<&str> = text.lines().collect();
            match pretty_format_lines(&lines) {
                Some(table) => println!("{}", table),
                None if lines.is_empty() => println!("ok"),
                None => lines.iter().for_each(|line| println!("{}", line)),
            }
        }
        Response::Error(message) => println!("ERROR: {}", message),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();
    let config = ServerConfig::default();
    let addr = args.addr.unwrap_or(config.listen_addr);

    let stream = TcpStream::connect(&addr)
        .await
        .unwrap_or_else(|e| panic!("fail to connect to {}: {}", addr, e));
    let mut framed = Framed::new(stream, ClientCodec::new(config.max_payload));

    if let Some(query) = args.command {
        framed.send(parse_line(&query)).await.expect("send");
        match framed.next().await {
            Some(Ok(response)) => print_response(response),
            Some(Err(e)) => println!("Error: {}", e),
            None => println!("server closed the connection"),
        }
        return;
    }

    println!(":) Connected to quill-store at {}. Type \\q to quit.", addr);
    let mut rl = DefaultEditor::new().expect("created editor");
    rl.load_history(".quill_history").ok();

    loop {
        match rl.readline("quill=# ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line.as_str());
                if line.trim() == "exit" || line.trim() == "\\q" {
                    println!("bye!");
                    break;
                }
                if let Err(e) = framed.send(parse_line(&line)).await {
                    println!("Error: {}", e);
                    continue;
                }
                match framed.next().await {
                    Some(Ok(response)) => print_response(response),
                    Some(Err(e)) => {
                        println!("Error: {}", e);
                        break;
                    }
                    None => {
                        println!("server closed the connection");
                        break;
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }

    rl.save_history(".quill_history").ok();
}
