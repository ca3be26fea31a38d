use anyhow::{bail, Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facelink", about = "facelink face recognition CLI")]
struct Cli {
    /// Base URL of the facelinkd service
    #[arg(long, env = "FACELINK_SERVER", default_value = "http://127.0.0.1:5001")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract the embedding of the first face in an image
    Detect {
        /// JPEG or PNG photo
        image: PathBuf,
    },
    /// Compare two embeddings through the service
    Verify {
        /// JSON array, or a `detect` response with an `embedding` field
        embedding1: PathBuf,
        embedding2: PathBuf,
    },
    /// Compare two embeddings locally, without the service
    Compare {
        embedding1: PathBuf,
        embedding2: PathBuf,
    },
    /// Show service health
    Health,
    /// List model assets known to the service
    Models,
    /// Push locally cached model weights to durable storage (serverless only)
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let base = cli.server.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();

    let output = match cli.command {
        Commands::Detect { image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("failed to read {}", image.display()))?;
            let body = json!({ "image": base64::engine::general_purpose::STANDARD.encode(bytes) });
            post(&client, &base, "detect_face", &body).await?
        }
        Commands::Verify {
            embedding1,
            embedding2,
        } => {
            let body = json!({
                "embedding1": load_embedding(&embedding1)?,
                "embedding2": load_embedding(&embedding2)?,
            });
            post(&client, &base, "verify_faces", &body).await?
        }
        Commands::Compare {
            embedding1,
            embedding2,
        } => {
            let e1 = load_embedding(&embedding1)?;
            let e2 = load_embedding(&embedding2)?;
            let c = facelink_core::compare(&e1, &e2)?;
            json!({
                "is_match": c.is_match,
                "cosine_similarity": c.cosine_similarity,
                "euclidean_distance": c.euclidean_distance,
                "confidence_level": c.confidence_level,
                "threshold_used": facelink_core::MATCH_THRESHOLD,
            })
        }
        Commands::Health => get(&client, &base, "health").await?,
        Commands::Models => get(&client, &base, "models_info").await?,
        Commands::Sync => post(&client, &base, "sync_models", &json!({})).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn get(client: &reqwest::Client, base: &str, path: &str) -> Result<Value> {
    let url = format!("{base}/{path}");
    tracing::debug!(%url, "GET");
    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?;
    read_response(resp).await
}

async fn post(client: &reqwest::Client, base: &str, path: &str, body: &Value) -> Result<Value> {
    let url = format!("{base}/{path}");
    tracing::debug!(%url, "POST");
    let resp = client
        .post(&url)
        .json(body)
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?;
    read_response(resp).await
}

async fn read_response(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let body: Value = resp.json().await.context("service returned a non-JSON body")?;
    if !status.is_success() {
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        bail!("{status}: {message}");
    }
    Ok(body)
}

/// Read an embedding from a bare JSON array or an object with an
/// `embedding` field.
fn load_embedding(path: &Path) -> Result<Vec<f32>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_embedding(&text).with_context(|| format!("invalid embedding in {}", path.display()))
}

fn parse_embedding(text: &str) -> Result<Vec<f32>> {
    let value: Value = serde_json::from_str(text)?;
    let array = match &value {
        Value::Array(_) => &value,
        Value::Object(map) => match map.get("embedding") {
            Some(e) => e,
            None => bail!("object has no `embedding` field"),
        },
        _ => bail!("expected an array of numbers"),
    };
    Ok(serde_json::from_value(array.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_array() {
        assert_eq!(parse_embedding("[1, 0.5, -2]").unwrap(), vec![1.0, 0.5, -2.0]);
    }

    #[test]
    fn test_parse_detect_response() {
        let text = r#"{"success":true,"embedding":[0.25,0.75],"faces_count":1}"#;
        assert_eq!(parse_embedding(text).unwrap(), vec![0.25, 0.75]);
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        assert!(parse_embedding(r#"{"success":false}"#).is_err());
        assert!(parse_embedding("42").is_err());
        assert!(parse_embedding(r#"["a"]"#).is_err());
    }

    #[test]
    fn test_load_embedding_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e.json");
        std::fs::write(&path, "[3, 4]").unwrap();
        assert_eq!(load_embedding(&path).unwrap(), vec![3.0, 4.0]);
        assert!(load_embedding(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_cli_parses_server_and_command() {
        let cli = Cli::try_parse_from(["facelink", "--server", "http://h:1/", "compare", "a", "b"]).unwrap();
        assert_eq!(cli.server, "http://h:1/");
        assert!(matches!(cli.command, Commands::Compare { .. }));
    }
}
