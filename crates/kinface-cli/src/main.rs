use anyhow::{Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use kinface_core::{ModelProfile, RosterStore};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "kinface", about = "kinface household face recognition CLI")]
struct Cli {
    /// Base URL of the kinfaced HTTP API
    #[arg(long, global = true, default_value = "http://127.0.0.1:5000")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from one or more photos
    Enroll {
        /// Display name (e.g. "Alice")
        #[arg(short, long)]
        name: String,
        /// Relation to the household (e.g. "daughter")
        #[arg(short, long)]
        relation: String,
        /// Photo files
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Identify every face in a photo
    Recognize {
        /// Photo file
        image: PathBuf,
    },
    /// List enrolled persons
    List,
    /// Remove an enrolled person by id
    Remove {
        /// Person id as shown by `list`
        id: usize,
    },
    /// Show daemon status
    Status,
    /// Read the roster file directly and report its contents
    Inspect {
        /// Roster file (defaults to the daemon's default location)
        #[arg(long)]
        roster: Option<PathBuf>,
        #[command(flatten)]
        profile: ProfileArgs,
    },
    /// Replace the roster file with an empty one (stop the daemon first)
    Reset {
        /// Confirm that every enrolled person will be lost
        #[arg(long)]
        yes: bool,
        /// Roster file (defaults to the daemon's default location)
        #[arg(long)]
        roster: Option<PathBuf>,
        #[command(flatten)]
        profile: ProfileArgs,
    },
}

#[derive(clap::Args)]
struct ProfileArgs {
    /// Embedding model identifier the roster is bound to
    #[arg(long, default_value = kinface_core::DEFAULT_MODEL)]
    model: String,
    /// Embedding dimension the roster is bound to
    #[arg(long, default_value_t = kinface_core::DEFAULT_DIMENSION)]
    dimension: usize,
}

impl ProfileArgs {
    fn profile(&self) -> ModelProfile {
        ModelProfile::new(self.model.clone(), self.dimension)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = Client::new(&cli.url);

    match cli.command {
        Commands::Enroll {
            name,
            relation,
            images,
        } => {
            let images = images
                .iter()
                .map(|p| encode_image_file(p))
                .collect::<Result<Vec<_>>>()?;
            let body = client
                .post(
                    "/add-person",
                    json!({ "name": name, "relation": relation, "images": images }),
                )
                .await?;
            println!(
                "Enrolled {name} ({relation}) as id {}: {} photo(s) used, {} skipped",
                body["person_id"], body["embeddings"], body["skipped"]
            );
        }
        Commands::Recognize { image } => {
            let image = encode_image_file(&image)?;
            let body = client.post("/recognize", json!({ "image": image })).await?;
            for line in describe_faces(&body) {
                println!("{line}");
            }
        }
        Commands::List => {
            let body = client.get("/persons").await?;
            let persons = body["persons"].as_array().cloned().unwrap_or_default();
            if persons.is_empty() {
                println!("No persons enrolled");
            }
            for p in persons {
                println!("{:>3}  {}  ({})", p["id"], text(&p["name"]), text(&p["relation"]));
            }
        }
        Commands::Remove { id } => {
            let body = client.delete(&format!("/delete-person/{id}")).await?;
            println!("{}", text(&body["message"]));
        }
        Commands::Status => {
            let body = client.get("/status").await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Inspect { roster, profile } => {
            let path = roster.unwrap_or_else(kinface_core::default_roster_path);
            inspect(&path, &profile.profile())?;
        }
        Commands::Reset {
            yes,
            roster,
            profile,
        } => {
            let path = roster.unwrap_or_else(kinface_core::default_roster_path);
            reset(&path, &profile.profile(), yes)?;
            println!("Roster at {} reset to empty", path.display());
        }
    }

    Ok(())
}

/// Thin JSON client for the daemon API.
struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.send(self.http.get(self.url(path))).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.send(self.http.post(self.url(path)).json(&body)).await
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        self.send(self.http.delete(self.url(path))).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request
            .send()
            .await
            .with_context(|| format!("could not reach kinfaced at {}", self.base))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .with_context(|| format!("unreadable response (HTTP {status})"))?;
        tracing::debug!(%status, %body, "daemon response");
        check_response(status.as_u16(), body)
    }
}

/// Turn a `{"success": false, ...}` body or an error status into an error.
fn check_response(status: u16, body: Value) -> Result<Value> {
    if body["success"] == Value::Bool(false) || status >= 400 {
        let message = body
            .get("error")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("request failed");
        anyhow::bail!("{message} (HTTP {status})");
    }
    Ok(body)
}

fn describe_faces(body: &Value) -> Vec<String> {
    let faces = body["faces"].as_array().cloned().unwrap_or_default();
    faces
        .iter()
        .enumerate()
        .map(|(i, face)| {
            let name = text(&face["name"]);
            let confidence = face["confidence"].as_f64().unwrap_or(0.0);
            let relation = text(&face["relation"]);
            if relation.is_empty() {
                format!("face {}: {name} ({confidence:.2}%)", i + 1)
            } else {
                format!("face {}: {name}, {relation} ({confidence:.2}%)", i + 1)
            }
        })
        .collect()
}

fn text(v: &Value) -> String {
    v.as_str().unwrap_or_default().to_string()
}

/// Read a photo and wrap it as a base64 data URL.
fn encode_image_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(data_url(path, &bytes))
}

fn data_url(path: &Path, bytes: &[u8]) -> String {
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    };
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("data:{mime};base64,{encoded}")
}

fn inspect(path: &Path, profile: &ModelProfile) -> Result<()> {
    println!("Roster: {}", path.display());
    if !path.exists() {
        println!("  (no file; the daemon starts with an empty roster)");
        return Ok(());
    }
    let roster = match RosterStore::load(path, profile) {
        Ok(roster) => roster,
        Err(e) if e.is_corruption() => {
            anyhow::bail!(
                "{e}\nrun `kinface reset --yes --roster {}` to replace it",
                path.display()
            );
        }
        Err(e) => return Err(e.into()),
    };
    println!("Model: {profile}");
    println!("Persons: {}", roster.len());
    for (id, person) in roster.iter() {
        println!(
            "{id:>3}  {}  ({})  {} embedding(s), enrolled {}",
            person.name,
            person.relation,
            person.embeddings.len(),
            person.enrolled_at.format("%Y-%m-%d %H:%M UTC")
        );
    }
    Ok(())
}

fn reset(path: &Path, profile: &ModelProfile, confirmed: bool) -> Result<()> {
    if !confirmed {
        anyhow::bail!("reset deletes every enrolled person; pass --yes to confirm");
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    RosterStore::reset(path, profile).with_context(|| format!("resetting {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_enroll() {
        let cli = Cli::try_parse_from([
            "kinface", "enroll", "-n", "Alice", "-r", "daughter", "a.jpg", "b.png",
        ])
        .unwrap();
        assert_eq!(cli.url, "http://127.0.0.1:5000");
        match cli.command {
            Commands::Enroll {
                name,
                relation,
                images,
            } => {
                assert_eq!(name, "Alice");
                assert_eq!(relation, "daughter");
                assert_eq!(images.len(), 2);
            }
            _ => panic!("expected enroll"),
        }
    }

    #[test]
    fn test_enroll_requires_images() {
        assert!(Cli::try_parse_from(["kinface", "enroll", "-n", "A", "-r", "b"]).is_err());
    }

    #[test]
    fn test_reset_defaults_to_arcface_profile() {
        let cli =
            Cli::try_parse_from(["kinface", "--url", "http://hub:5000", "reset", "--yes"]).unwrap();
        assert_eq!(cli.url, "http://hub:5000");
        match cli.command {
            Commands::Reset { yes, profile, .. } => {
                assert!(yes);
                assert_eq!(
                    profile.profile(),
                    ModelProfile::new(kinface_core::DEFAULT_MODEL, kinface_core::DEFAULT_DIMENSION)
                );
            }
            _ => panic!("expected reset"),
        }
    }

    #[test]
    fn test_data_url_mime() {
        assert!(data_url(Path::new("x.PNG"), b"abc").starts_with("data:image/png;base64,"));
        assert_eq!(data_url(Path::new("x.jpg"), b"abc"), "data:image/jpeg;base64,YWJj");
    }

    #[test]
    fn test_check_response() {
        assert!(check_response(200, json!({ "success": true })).is_ok());
        assert!(check_response(200, json!({ "persons": [] })).is_ok());

        let err = check_response(400, json!({ "success": false, "error": "name is required" }))
            .unwrap_err();
        assert!(err.to_string().contains("name is required"));

        let err = check_response(200, json!({ "success": false, "message": "no persons are enrolled" }))
            .unwrap_err();
        assert!(err.to_string().contains("no persons"));
    }

    #[test]
    fn test_describe_faces() {
        let body = json!({ "success": true, "faces": [
            { "name": "Alice", "relation": "daughter", "confidence": 91.5 },
            { "name": "unknown", "relation": "", "confidence": 12.0 },
        ]});
        assert_eq!(
            describe_faces(&body),
            vec![
                "face 1: Alice, daughter (91.50%)".to_string(),
                "face 2: unknown (12.00%)".to_string(),
            ]
        );
    }

    #[test]
    fn test_reset_requires_confirmation_then_inspects_clean() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/roster.json");
        let profile = ModelProfile::new("test", 4);

        assert!(reset(&path, &profile, false).is_err());
        assert!(!path.exists());

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();
        assert!(inspect(&path, &profile).is_err());

        reset(&path, &profile, true).unwrap();
        inspect(&path, &profile).unwrap();
        assert!(RosterStore::load(&path, &profile).unwrap().is_empty());
    }
}
