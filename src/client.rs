//! Interactive line client
//!
//! Backs `ferrodb connect <port>`: a thin translator from typed commands to
//! wire JSON lines. Presentation stays minimal; each server reply is printed
//! as the raw single-line JSON.

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Connect to a local server and run the command loop until EOF or `exit`
pub async fn run(port: u16) -> anyhow::Result<()> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.map_err(|e| {
        anyhow::anyhow!("could not connect to 127.0.0.1:{port}: {e}")
    })?;
    let (reader, mut writer) = stream.into_split();
    let mut server_lines = BufReader::new(reader).lines();

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let username = prompt(&mut stdin, "Username: ").await?;
    let password = prompt(&mut stdin, "Password: ").await?;

    let login = json!({"username": username, "password": password}).to_string();
    writer.write_all(login.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let Some(reply) = server_lines.next_line().await? else {
        anyhow::bail!("server closed the connection");
    };
    println!("{reply}");
    if reply.contains(r#""status":"ERROR""#) {
        anyhow::bail!("login failed");
    }

    use std::io::Write;

    let mut space = String::new();
    loop {
        print!("{}> ", if space.is_empty() { "ferrodb" } else { space.as_str() });
        std::io::stdout().flush()?;

        let Some(line) = stdin.next_line().await? else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        if line == "help" {
            print_help();
            continue;
        }

        let request = match build_request(line, &mut space) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(message) => {
                eprintln!("{message}");
                continue;
            }
        };

        writer.write_all(request.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        match server_lines.next_line().await? {
            Some(reply) => println!("{reply}"),
            None => {
                eprintln!("server closed the connection");
                break;
            }
        }
    }

    Ok(())
}

async fn prompt(
    stdin: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
    label: &str,
) -> anyhow::Result<String> {
    print!("{label}");
    use std::io::Write;
    std::io::stdout().flush()?;
    stdin
        .next_line()
        .await?
        .ok_or_else(|| anyhow::anyhow!("stdin closed"))
}

/// Translate one typed command into a wire JSON line.
///
/// Returns `Ok(None)` for commands handled locally.
fn build_request(line: &str, space: &mut String) -> Result<Option<String>, String> {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or("");
    let args: Vec<&str> = parts.collect();

    let request = match command {
        "use" => {
            let name = one_arg(&args, "use <space>")?;
            *space = name.to_string();
            json!({"type": "USE_SPACE", "space": name})
        }
        "put" => {
            if args.len() < 2 {
                return Err("usage: put <key> <value>".into());
            }
            json!({"type": "PUT", "space": space, "key": args[0], "value": args[1..].join(" ")})
        }
        "get" => {
            let key = one_arg(&args, "get <key>")?;
            json!({"type": "GET", "space": space, "key": key})
        }
        "delete" => {
            let key = one_arg(&args, "delete <key>")?;
            json!({"type": "DELETE", "space": space, "key": key})
        }
        "list-spaces" => json!({"type": "LIST_SPACES"}),
        "create-space" => match args.as_slice() {
            [name] => json!({"type": "CREATE_SPACE", "space": name}),
            [name, dim, rest @ ..] => {
                let dimension: usize = dim
                    .parse()
                    .map_err(|_| "usage: create-space <name> [<dimension> [index] [metric]]")?;
                json!({
                    "type": "CREATE_SPACE",
                    "space": name,
                    "engine_type": "vector",
                    "dimension": dimension,
                    "index_type": rest.first().copied().unwrap_or("Flat"),
                    "metric": rest.get(1).copied().unwrap_or("L2"),
                })
            }
            _ => return Err("usage: create-space <name> [<dimension> [index] [metric]]".into()),
        },
        "delete-space" => {
            let name = one_arg(&args, "delete-space <name>")?;
            json!({"type": "DELETE_SPACE", "data": name})
        }
        "insert-vector" => {
            if args.len() != 2 {
                return Err("usage: insert-vector <id> <f,f,...>".into());
            }
            json!({"type": "INSERT_VECTOR", "space": space, "key": args[0], "value": args[1]})
        }
        "search-topk" => {
            if args.len() != 2 {
                return Err("usage: search-topk <k> <f,f,...>".into());
            }
            let k: i64 = args[0].parse().map_err(|_| "k must be an integer")?;
            json!({"type": "SEARCH_TOPK", "space": space, "dimension": k, "value": args[1]})
        }
        "range-search" => {
            if args.len() != 2 {
                return Err("usage: range-search <radius> <f,f,...>".into());
            }
            let radius: f32 = args[0].parse().map_err(|_| "radius must be a number")?;
            json!({"type": "RANGE_SEARCH", "space": space, "radius": radius, "value": args[1]})
        }
        "get-vector" => {
            let id = one_arg(&args, "get-vector <id>")?;
            json!({"type": "GET_VECTOR", "space": space, "key": id})
        }
        "raw" => {
            // Pass an arbitrary JSON line through untouched
            let rest = line.trim_start_matches("raw").trim();
            if rest.is_empty() {
                return Err("usage: raw <json>".into());
            }
            return Ok(Some(rest.to_string()));
        }
        other => return Err(format!("unknown command '{other}' (try 'help')")),
    };

    Ok(Some(request.to_string()))
}

fn one_arg<'a>(args: &[&'a str], usage: &str) -> Result<&'a str, String> {
    match args {
        [only] => Ok(only),
        _ => Err(format!("usage: {usage}")),
    }
}

fn print_help() {
    println!(
        "commands:\n  \
         use <space>\n  \
         put <key> <value>          get <key>          delete <key>\n  \
         create-space <name> [<dimension> [index] [metric]]\n  \
         delete-space <name>        list-spaces\n  \
         insert-vector <id> <f,f,...>\n  \
         search-topk <k> <f,f,...>  range-search <radius> <f,f,...>\n  \
         get-vector <id>\n  \
         raw <json>                 exit"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_kv_requests() {
        let mut space = "kv1".to_string();

        let line = build_request("put user:1 alice smith", &mut space)
            .unwrap()
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["type"], "PUT");
        assert_eq!(parsed["value"], "alice smith");
        assert_eq!(parsed["space"], "kv1");

        let line = build_request("get user:1", &mut space).unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["type"], "GET");
    }

    #[test]
    fn test_use_updates_session_space() {
        let mut space = String::new();
        build_request("use vec1", &mut space).unwrap();
        assert_eq!(space, "vec1");
    }

    #[test]
    fn test_build_vector_requests() {
        let mut space = "vec1".to_string();

        let line = build_request("search-topk 5 1,2,3,4", &mut space)
            .unwrap()
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["type"], "SEARCH_TOPK");
        assert_eq!(parsed["dimension"], 5);
        assert_eq!(parsed["value"], "1,2,3,4");
    }

    #[test]
    fn test_create_vector_space_command() {
        let mut space = String::new();
        let line = build_request("create-space vec1 4 IVF32,Flat L2", &mut space)
            .unwrap()
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["engine_type"], "vector");
        assert_eq!(parsed["dimension"], 4);
        assert_eq!(parsed["index_type"], "IVF32,Flat");
    }

    #[test]
    fn test_unknown_command() {
        let mut space = String::new();
        assert!(build_request("frobnicate", &mut space).is_err());
    }
}
