use anyhow::{bail, Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use rollcall_core::{FacePipeline, Gallery};
use rollcall_hw::Camera;
use serde::Deserialize;
use std::path::PathBuf;

const DEFAULT_SERVER: &str = "http://127.0.0.1:5000";

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-recognition attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attendance records
    Records {
        /// Only records for this date (YYYY-MM-DD)
        #[arg(short, long)]
        date: Option<String>,
        /// Only records for this identity
        #[arg(short, long)]
        name: Option<String>,
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Submit an image file and mark attendance for the face in it
    Mark {
        image: PathBuf,
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Show daemon status
    Status {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Load a known-faces directory offline and list who enrolls
    Gallery {
        dir: PathBuf,
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
    },
}

#[derive(Debug, Deserialize)]
struct Record {
    name: String,
    date: String,
    time: String,
}

#[derive(Debug, Deserialize)]
struct MarkReply {
    status: String,
    name: Option<String>,
    message: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Records { date, name, server } => {
            let mut query = Vec::new();
            if let Some(date) = date {
                query.push(("date", date));
            }
            if let Some(name) = name {
                query.push(("name", name));
            }
            let records: Vec<Record> = reqwest::Client::new()
                .get(endpoint(&server, "attendance_records"))
                .query(&query)
                .send()
                .await
                .with_context(|| format!("rollcalld not reachable at {server}"))?
                .error_for_status()?
                .json()
                .await?;
            print!("{}", format_records(&records));
        }
        Commands::Mark { image, server } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("cannot read {}", image.display()))?;
            tracing::debug!(path = %image.display(), bytes = bytes.len(), "submitting image");
            let body = serde_json::json!({
                "image": base64::engine::general_purpose::STANDARD.encode(bytes),
            });
            let reply: MarkReply = reqwest::Client::new()
                .post(endpoint(&server, "mark_attendance"))
                .json(&body)
                .send()
                .await
                .with_context(|| format!("rollcalld not reachable at {server}"))?
                .json()
                .await?;
            match (reply.status.as_str(), reply.name, reply.message) {
                ("success", Some(name), _) => println!("Attendance marked for {name}"),
                ("duplicate", Some(name), _) => println!("{name} is already marked today"),
                (_, _, Some(message)) => bail!("{message}"),
                (status, _, _) => bail!("unexpected reply status: {status}"),
            }
        }
        Commands::Status { server } => {
            let health: serde_json::Value = reqwest::Client::new()
                .get(endpoint(&server, "health"))
                .send()
                .await
                .with_context(|| format!("rollcalld not reachable at {server}"))?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Commands::Gallery { dir, model_dir } => {
            let model_dir = model_dir.unwrap_or_else(rollcall_core::default_model_dir);
            let mut pipeline =
                FacePipeline::load(&model_dir, rollcall_core::pipeline::DEFAULT_DETECT_SCALE)
                    .with_context(|| format!("failed to load models from {}", model_dir.display()))?;
            let (gallery, skipped) = Gallery::load_dir(&dir, &mut pipeline)?;

            println!("{} enrolled from {}", gallery.len(), dir.display());
            for entry in gallery.entries() {
                println!("  {:<20} {}", entry.identity, entry.source.display());
            }
            if !skipped.is_empty() {
                println!("{} skipped:", skipped.len());
                for skip in &skipped {
                    println!("  {}: {}", skip.path.display(), skip.reason);
                }
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Test { device } => {
            println!("Running camera diagnostics on {device}...");
            let camera = Camera::open(&device, 640, 480)?;
            println!(
                "  format: {}x{} {:?}",
                camera.width,
                camera.height,
                camera.pixel_format()
            );
            let frame = camera.capture_frame()?;
            println!("  frame #{}: {}x{}", frame.sequence, frame.width, frame.height);
            println!("  brightness: {:.1}", frame.avg_brightness());
            if frame.is_dark {
                println!("  warning: frame is dark; check lighting or lens cover");
            }
        }
    }

    Ok(())
}

fn endpoint(server: &str, path: &str) -> String {
    format!("{}/{path}", server.trim_end_matches('/'))
}

fn format_records(records: &[Record]) -> String {
    if records.is_empty() {
        return "No attendance records\n".to_string();
    }
    let width = records.iter().map(|r| r.name.len()).max().unwrap_or(0).max(4);
    let mut out = format!("{:<width$}  {:<10}  {}\n", "NAME", "DATE", "TIME");
    for r in records {
        out.push_str(&format!("{:<width$}  {:<10}  {}\n", r.name, r.date, r.time));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_paths() {
        assert_eq!(endpoint("http://host:5000/", "health"), "http://host:5000/health");
        assert_eq!(endpoint("http://host:5000", "health"), "http://host:5000/health");
    }

    #[test]
    fn test_format_records_aligns_names() {
        let records = vec![
            Record { name: "al".into(), date: "2024-01-02".into(), time: "09:00:00".into() },
            Record { name: "bartholomew".into(), date: "2024-01-02".into(), time: "09:05:00".into() },
        ];
        let table = format_records(&records);
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("NAME         DATE"));
        assert!(lines[1].starts_with("al           2024-01-02"));
        assert_eq!(format_records(&[]), "No attendance records\n");
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["rollcall", "records", "--date", "2024-01-02"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Records { date: Some(ref d), name: None, ref server } if d == "2024-01-02" && server == DEFAULT_SERVER
        ));
        assert!(Cli::try_parse_from(["rollcall", "mark"]).is_err());
    }
}
