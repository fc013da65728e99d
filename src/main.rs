use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use blobstream::rpc::{
    METHOD_PROGRESS, METHOD_RECEIVE_BINARY, METHOD_UPLOAD_PATH,
};
use blobstream::{PipelineConfig, Scene, UploadService};

const CLIENT: u64 = 1;
const REQUEST_ID: u64 = 1;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[clap(name = "blobstream")]
#[clap(about = "Stream and load point clouds and meshes", long_about = None)]
struct Cli {
    /// JSON pipeline configuration; defaults plus BLOBSTREAM_* variables
    /// otherwise
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a local file as binary frames
    Upload {
        file: PathBuf,
        #[clap(long = "type")]
        type_tag: Option<String>,
        #[clap(long, default_value_t = 64 * 1024)]
        chunk_size: usize,
    },
    /// Load files or directories by path
    Load {
        #[clap(required = true)]
        paths: Vec<PathBuf>,
    },
    /// List supported types
    Types,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::from_env()?,
    };
    let interval = config.progress_interval().max(Duration::from_millis(1));
    let scene = Scene::shared();
    let service = UploadService::new(config, scene.clone())?;

    let outcome = match cli.command {
        Command::Upload {
            file,
            type_tag,
            chunk_size,
        } => upload(&service, &file, type_tag, chunk_size, interval),
        Command::Load { paths } => load(&service, &paths, interval),
        Command::Types => {
            for type_tag in service.supported_types() {
                println!("{}", type_tag);
            }
            Ok(())
        }
    };
    service.shutdown(SHUTDOWN_TIMEOUT);
    outcome?;

    let scene = scene.read().map_err(|_| anyhow!("scene lock poisoned"))?;
    for model in scene.models() {
        println!(
            "{} ({}): {} primitives",
            model.name,
            model.type_tag,
            model.geometry.primitive_count()
        );
    }
    Ok(())
}

fn upload(
    service: &UploadService,
    file: &Path,
    type_tag: Option<String>,
    chunk_size: usize,
    interval: Duration,
) -> Result<()> {
    if chunk_size == 0 {
        bail!("chunk size must be positive");
    }
    let bytes = fs::read(file)
        .with_context(|| format!("could not read {}", file.display()))?;
    let type_tag = match type_tag {
        Some(type_tag) => type_tag,
        None => file
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .ok_or_else(|| {
                anyhow!(
                    "no --type given and {} has no extension",
                    file.display()
                )
            })?,
    };
    let name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let request = json!({
        "jsonrpc": "2.0",
        "id": REQUEST_ID,
        "method": METHOD_RECEIVE_BINARY,
        "params": [{"size": bytes.len(), "type": type_tag, "name": name}],
    });
    if let Some(response) = service.handle_text(CLIENT, &request.to_string()) {
        return finish(&response);
    }
    for chunk in bytes.chunks(chunk_size) {
        service.handle_binary(CLIENT, chunk);
    }
    wait_for_response(service, interval)
}

fn load(
    service: &UploadService,
    paths: &[PathBuf],
    interval: Duration,
) -> Result<()> {
    let paths: Vec<String> =
        paths.iter().map(|p| p.display().to_string()).collect();
    let request = json!({
        "jsonrpc": "2.0",
        "id": REQUEST_ID,
        "method": METHOD_UPLOAD_PATH,
        "params": paths,
    });
    if let Some(response) = service.handle_text(CLIENT, &request.to_string()) {
        return finish(&response);
    }
    wait_for_response(service, interval)
}

fn wait_for_response(
    service: &UploadService,
    interval: Duration,
) -> Result<()> {
    loop {
        for outgoing in service.poll() {
            let message: Value = serde_json::from_str(&outgoing.message)?;
            if message["method"] == METHOD_PROGRESS {
                let params = &message["params"];
                println!(
                    "[{:>5.1}%] {}",
                    params["amount"].as_f64().unwrap_or(0.0) * 100.0,
                    params["operation"].as_str().unwrap_or_default()
                );
            } else {
                return finish(&outgoing.message);
            }
        }
        thread::sleep(interval);
    }
}

fn finish(response: &str) -> Result<()> {
    let response: Value = serde_json::from_str(response)?;
    match response.get("error") {
        Some(error) => Err(anyhow!(
            "request failed ({}): {}",
            error["code"],
            error["message"].as_str().unwrap_or_default()
        )),
        None => Ok(()),
    }
}
