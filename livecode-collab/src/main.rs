//! `livecode-server` binary.
//!
//! Usage:
//!   # Ephemeral, in-memory documents seeded from files
//!   livecode-server --seed d1=snippets/main.rs
//!
//!   # RocksDB-backed
//!   livecode-server --storage ./livecode_data
//!   livecode-server put d1 main.rs --language rust --storage ./livecode_data
//!   livecode-server get d1 --storage ./livecode_data
//!
//! Logging is controlled with `RUST_LOG` (e.g. `RUST_LOG=livecode_collab=debug`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use livecode_collab::server::{ServerConfig, SessionServer};
use livecode_collab::session::SessionConfig;
use livecode_collab::storage::{
    Document, DocumentStore, MemoryDocumentStore, RocksDocumentStore, StoreConfig, DEFAULT_LANGUAGE,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Collaborative live-coding session server.
#[derive(Parser, Debug)]
#[command(name = "livecode-server", version)]
#[command(about = "Real-time collaborative editing sessions over WebSocket")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the session server (default)
    Serve(ServeArgs),
    /// Create or replace a document in the RocksDB store
    Put {
        id: String,
        file: PathBuf,
        /// Language tag; guessed from the file extension if omitted
        #[arg(long)]
        language: Option<String>,
        #[arg(long, env = "LIVECODE_STORAGE")]
        storage: PathBuf,
    },
    /// Print a document from the RocksDB store
    Get {
        id: String,
        #[arg(long, env = "LIVECODE_STORAGE")]
        storage: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "LIVECODE_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; documents are kept in memory if omitted
    #[arg(long, env = "LIVECODE_STORAGE")]
    storage: Option<PathBuf>,

    /// Preload a document as ID=FILE (repeatable)
    #[arg(long, value_name = "ID=FILE")]
    seed: Vec<String>,

    /// Close connections silent for this many seconds (0 disables)
    #[arg(long, env = "LIVECODE_IDLE_TIMEOUT_SECS", default_value_t = 60)]
    idle_timeout_secs: u64,

    /// WebSocket message/frame ceiling in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    max_frame_bytes: usize,

    /// Largest accepted change delta in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    max_change_bytes: usize,

    /// Largest accepted presence payload in bytes
    #[arg(long, default_value_t = 16 * 1024)]
    max_presence_bytes: usize,

    /// Store load timeout during room creation, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    load_timeout_ms: u64,

    /// Per-attempt save timeout at room teardown, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    save_timeout_ms: u64,

    /// Save attempts before unsaved content is parked in memory
    #[arg(long, default_value_t = 3)]
    save_attempts: u32,

    /// Frames queued per connection before it is dropped as too slow
    #[arg(long, default_value_t = 256)]
    outbox_capacity: usize,
}

impl ServeArgs {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            idle_timeout_secs: self.idle_timeout_secs,
            max_frame_bytes: self.max_frame_bytes,
            storage_path: self.storage.clone(),
            session: SessionConfig {
                max_change_bytes: self.max_change_bytes,
                max_presence_bytes: self.max_presence_bytes,
                load_timeout: Duration::from_millis(self.load_timeout_ms),
                save_timeout: Duration::from_millis(self.save_timeout_ms),
                save_attempts: self.save_attempts,
                outbox_capacity: self.outbox_capacity,
                ..SessionConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Serve(args)) => serve(args).await,
        None => serve(cli.serve).await,
        Some(Command::Put {
            id,
            file,
            language,
            storage,
        }) => {
            let store = RocksDocumentStore::open(StoreConfig::new(storage))?;
            let language = language.unwrap_or_else(|| language_for(&file).to_string());
            let content = std::fs::read_to_string(&file)?;
            let meta = store.put_document(&Document::new(id.as_str(), content, language))?;
            store.sync()?;
            println!("{id}: revision {} ({} bytes, {})", meta.revision, meta.content_size, meta.language);
            Ok(())
        }
        Some(Command::Get { id, storage }) => {
            let store = RocksDocumentStore::open(StoreConfig::new(storage))?;
            match store.load_document(&id.as_str().into())? {
                Some(doc) => {
                    print!("{}", doc.content);
                    Ok(())
                }
                None => Err(format!("document {id} not found").into()),
            }
        }
    }
}

async fn serve(args: ServeArgs) -> Result<(), BoxError> {
    let config = args.server_config();

    let seeds = args
        .seed
        .iter()
        .map(String::as_str)
        .map(read_seed)
        .collect::<Result<Vec<Document>, BoxError>>()?;

    let store: Arc<dyn DocumentStore> = match &config.storage_path {
        Some(path) => {
            let store = RocksDocumentStore::open(StoreConfig::new(path))?;
            for doc in &seeds {
                store.put_document(doc)?;
            }
            Arc::new(store)
        }
        None => {
            log::warn!("No --storage given, documents live in memory only");
            let store = MemoryDocumentStore::new();
            for doc in seeds.iter().cloned() {
                store.insert(doc);
            }
            Arc::new(store)
        }
    };
    if !seeds.is_empty() {
        log::info!("Seeded {} documents", seeds.len());
    }

    let server = SessionServer::new(config, store);
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupt received, persisting live rooms");
            let unsaved = server.shutdown().await;
            if unsaved > 0 {
                return Err(format!("{unsaved} documents could not be saved").into());
            }
            Ok(())
        }
    }
}

fn read_seed(spec: &str) -> Result<Document, BoxError> {
    let (id, file) = spec
        .split_once('=')
        .ok_or_else(|| format!("invalid --seed '{spec}', expected ID=FILE"))?;
    let path = Path::new(file);
    let content = std::fs::read_to_string(path)?;
    Ok(Document::new(id, content, language_for(path)))
}

fn language_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("rs") => "rust",
        Some("py") => "python",
        Some("js") => "javascript",
        Some("ts") => "typescript",
        Some("go") => "go",
        Some("c") | Some("h") => "c",
        Some("cpp") | Some("cc") | Some("hpp") => "cpp",
        Some("java") => "java",
        Some("rb") => "ruby",
        _ => DEFAULT_LANGUAGE,
    }
}
