use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_TAG_LEN: usize = 20;
const ATTEMPTS: usize = 3;

/// A CLI for interacting with a tagfs cluster.
#[derive(Parser, Debug)]
#[command(name = "tagfs", version, about)]
struct Cli {
    /// Gateway URL of any node in the cluster.
    #[arg(long, global = true, default_value = "http://127.0.0.1:6000")]
    node: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Adds files to the system, giving each of them all of `tags`.
    Add {
        #[arg(short = 'f', long = "files", num_args = 1.., required = true)]
        files: Vec<PathBuf>,
        #[arg(short = 't', long = "tags", num_args = 1.., required = true)]
        tags: Vec<String>,
    },
    /// Writes the contents of a file to stdout, or to `--output`.
    Get {
        id: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Shows the tags, version and digest of a file.
    Stat { id: String },
    /// Lists the files carrying every tag of the query, or matching `--expr`.
    List {
        #[arg(short = 'q', long = "tag-query", num_args = 1..)]
        tag_query: Vec<String>,
        /// Full expression, e.g. "red AND (small OR big)".
        #[arg(long, conflicts_with = "tag_query")]
        expr: Option<String>,
    },
    /// Removes every file carrying all tags of the query.
    Delete {
        #[arg(short = 'q', long = "tag-query", num_args = 1.., required = true)]
        tag_query: Vec<String>,
    },
    /// Removes one file by id.
    Rm { id: String },
    /// Adds the tags of `tag-list` to every file carrying all tags of the query.
    AddTags {
        #[arg(short = 'q', long = "tag-query", num_args = 1.., required = true)]
        tag_query: Vec<String>,
        #[arg(short = 't', long = "tag-list", num_args = 1.., required = true)]
        tag_list: Vec<String>,
    },
    /// Removes the tags of `tag-list` from every file carrying all tags of the query.
    DeleteTags {
        #[arg(short = 'q', long = "tag-query", num_args = 1.., required = true)]
        tag_query: Vec<String>,
        #[arg(short = 't', long = "tag-list", num_args = 1.., required = true)]
        tag_list: Vec<String>,
    },
    /// Adds one tag to one file.
    Tag { id: String, tag: String },
    /// Removes one tag from one file.
    Untag { id: String, tag: String },
    /// Shows the cluster membership as seen by the node.
    Cluster,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<ErrorBody>,
    #[serde(default)]
    partial: bool,
    #[serde(default)]
    unreachable: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    kind: String,
    message: String,
}

/// Gateway client. Mutating requests carry a client id and a sequence
/// number, and a retry reuses both so the cluster applies it once.
struct Client {
    http: reqwest::Client,
    base: String,
    client_id: String,
    seq: u64,
}

impl Client {
    fn new(base: &str) -> Self {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
            client_id: format!("cli-{}-{}", std::process::id(), started),
            seq: 0,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Sends the request built by `build`, retrying transport failures with
    /// capped exponential backoff.
    async fn send<F>(&mut self, mutating: bool, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let seq = if mutating {
            self.seq += 1;
            Some(self.seq)
        } else {
            None
        };
        let mut delay_ms = 150u64;

        for attempt in 0..ATTEMPTS {
            let mut request = build(&self.http).timeout(Duration::from_secs(10));
            if let Some(seq) = seq {
                request = request
                    .header("x-client-id", &self.client_id)
                    .header("x-request-seq", seq.to_string());
            }

            match request.send().await {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt + 1 < ATTEMPTS => {
                    tracing::debug!("Request to {} failed (attempt {}): {}", self.base, attempt + 1, e);
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
                Err(e) => return Err(e).with_context(|| format!("cannot reach {}", self.base)),
            }
        }
        bail!("cannot reach {}", self.base)
    }

    async fn call<F>(&mut self, mutating: bool, build: F) -> Result<Value>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let resp = self.send(mutating, build).await?;
        let status = resp.status();
        let envelope: Envelope = resp
            .json()
            .await
            .with_context(|| format!("unexpected response (HTTP {})", status))?;
        open(envelope)
    }
}

fn open(envelope: Envelope) -> Result<Value> {
    if envelope.partial {
        eprintln!(
            "Warning: incomplete answer, unreachable nodes: {}",
            envelope.unreachable.join(", ")
        );
    }
    if !envelope.ok {
        match envelope.error {
            Some(e) => bail!("{}: {}", e.kind, e.message),
            None => bail!("request failed"),
        }
    }
    Ok(envelope.data.unwrap_or(Value::Null))
}

fn validate_tags(tags: &[String]) -> Result<()> {
    let errors: Vec<String> = tags
        .iter()
        .filter(|t| t.chars().count() > MAX_TAG_LEN)
        .map(|t| format!("the tag '{}' has more than {} characters", t, MAX_TAG_LEN))
        .collect();
    if !errors.is_empty() {
        bail!(errors.join("\n"));
    }
    Ok(())
}

fn validate_files(files: &[PathBuf]) -> Result<()> {
    let errors: Vec<String> = files
        .iter()
        .filter_map(|f| {
            if !f.exists() {
                Some(format!("the path '{}' doesn't exist", f.display()))
            } else if !f.is_file() {
                Some(format!("the path '{}' is not a regular file", f.display()))
            } else {
                None
            }
        })
        .collect();
    if !errors.is_empty() {
        bail!(errors.join("\n"));
    }
    Ok(())
}

fn conjunction(tags: &[String]) -> String {
    tags.join(" AND ")
}

fn print_files(files: &Value) {
    let Some(files) = files.as_array() else {
        return;
    };
    for file in files {
        let tags: Vec<&str> = file["tags"]
            .as_array()
            .map(|ts| ts.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        println!(
            "{}  v{}  {}B  [{}]",
            file["file_id"].as_str().unwrap_or("?"),
            file["version"],
            file["size"],
            tags.join(", ")
        );
    }
    println!("{} file(s)", files.len());
}

fn print_bulk(verb: &str, outcome: &Value) {
    let applied = outcome["applied"].as_array().map(Vec::len).unwrap_or(0);
    println!("{} {} file(s)", verb, applied);
    if let Some(failed) = outcome["failed"].as_array() {
        for f in failed {
            eprintln!(
                "Error: {}: {}",
                f["file_id"].as_str().unwrap_or("?"),
                f["error"]["message"].as_str().unwrap_or("unknown error")
            );
        }
    }
}

async fn upload(client: &mut Client, file: &Path, tags: &str) -> Result<Value> {
    let payload = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let url = client.url("/files");
    client
        .call(true, |http| {
            http.post(&url)
                .query(&[("tags", tags)])
                .body(payload.clone())
        })
        .await
}

async fn run(cli: Cli) -> Result<()> {
    let mut client = Client::new(&cli.node);

    match cli.command {
        Command::Add { files, tags } => {
            validate_files(&files)?;
            validate_tags(&tags)?;
            let tags = tags.join(",");
            for file in &files {
                let out = upload(&mut client, file, &tags).await?;
                println!(
                    "{}  {}",
                    out["file_id"].as_str().unwrap_or("?"),
                    file.display()
                );
            }
            println!("{} file(s) sent successfully", files.len());
        }
        Command::Get { id, output } => {
            let url = client.url(&format!("/files/{}", id));
            let resp = client.send(false, |http| http.get(&url)).await?;
            if !resp.status().is_success() {
                let envelope: Envelope = resp.json().await.context("unexpected response")?;
                open(envelope)?;
                bail!("request failed");
            }
            let bytes = resp.bytes().await?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, &bytes)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("{} bytes written to {}", bytes.len(), path.display());
                }
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&bytes)?;
                }
            }
        }
        Command::Stat { id } => {
            let url = client.url(&format!("/files/{}/meta", id));
            let meta = client.call(false, |http| http.get(&url)).await?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Command::List { tag_query, expr } => {
            let q = match expr {
                Some(expr) => expr,
                None if !tag_query.is_empty() => {
                    validate_tags(&tag_query)?;
                    conjunction(&tag_query)
                }
                None => bail!("give --tag-query or --expr"),
            };
            let url = client.url("/query");
            let files = client
                .call(false, |http| http.get(&url).query(&[("q", q.as_str())]))
                .await?;
            print_files(&files);
        }
        Command::Delete { tag_query } => {
            validate_tags(&tag_query)?;
            let body = json!({ "query": conjunction(&tag_query) });
            let url = client.url("/query/delete");
            let outcome = client.call(true, |http| http.post(&url).json(&body)).await?;
            print_bulk("Removed", &outcome);
        }
        Command::Rm { id } => {
            let url = client.url(&format!("/files/{}", id));
            client.call(true, |http| http.delete(&url)).await?;
            println!("Removed {}", id);
        }
        Command::AddTags { tag_query, tag_list } => {
            validate_tags(&tag_query)?;
            validate_tags(&tag_list)?;
            let body = json!({ "query": conjunction(&tag_query), "add": tag_list });
            let url = client.url("/query/tags");
            let outcome = client.call(true, |http| http.post(&url).json(&body)).await?;
            print_bulk("Tagged", &outcome);
        }
        Command::DeleteTags { tag_query, tag_list } => {
            validate_tags(&tag_query)?;
            validate_tags(&tag_list)?;
            let body = json!({ "query": conjunction(&tag_query), "remove": tag_list });
            let url = client.url("/query/tags");
            let outcome = client.call(true, |http| http.post(&url).json(&body)).await?;
            print_bulk("Untagged", &outcome);
        }
        Command::Tag { id, tag } => {
            validate_tags(std::slice::from_ref(&tag))?;
            let body = json!({ "tag": tag });
            let url = client.url(&format!("/files/{}/tags", id));
            let out = client.call(true, |http| http.post(&url).json(&body)).await?;
            println!("{} now at version {}", id, out["version"]);
        }
        Command::Untag { id, tag } => {
            let url = client.url(&format!("/files/{}/tags/{}", id, tag));
            let out = client.call(true, |http| http.delete(&url)).await?;
            println!("{} now at version {}", id, out["version"]);
        }
        Command::Cluster => {
            let url = client.url("/cluster");
            let view = client.call(false, |http| http.get(&url)).await?;
            println!("view version {} (local {})", view["version"], view["local_id"]);
            for member in view["members"].as_array().into_iter().flatten() {
                println!(
                    "  - {} {} gossip={} http={} inc={}",
                    member["id"].as_str().unwrap_or("?"),
                    member["state"].as_str().unwrap_or("?"),
                    member["gossip_addr"].as_str().unwrap_or("?"),
                    member["http_addr"].as_str().unwrap_or("?"),
                    member["incarnation"]
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
