use clap::{Parser, Subcommand};

use livecast_lib::config::{ClientConfig, DEFAULT_BACKEND_URL};
use livecast_lib::media::QualityPreset;
use livecast_lib::models::{Role, UserIdentity};

#[derive(Parser)]
#[command(name = "livecast", about = "Live stream and chat client")]
struct Cli {
    /// Backend base URL
    #[arg(long, global = true, env = "LIVECAST_BACKEND_URL", default_value = DEFAULT_BACKEND_URL)]
    backend_url: String,

    /// Bearer token for the REST API and chat sockets
    #[arg(long, global = true, env = "LIVECAST_TOKEN", default_value = "")]
    token: String,

    #[arg(long, global = true, env = "LIVECAST_USER_ID", default_value = "")]
    user_id: String,

    #[arg(long, global = true, env = "LIVECAST_USERNAME", default_value = "")]
    username: String,

    /// viewer, model or admin
    #[arg(long, global = true, env = "LIVECAST_ROLE", default_value = "viewer", value_parser = parse_role)]
    role: Role,

    /// Room this user owns when streaming as a model
    #[arg(long, global = true, env = "LIVECAST_MODEL_ROOM")]
    model_room: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Go live from this machine
    Broadcast {
        #[arg(long, value_enum, default_value_t = QualityPreset::Medium)]
        quality: QualityPreset,
    },
    /// Watch a broadcaster
    Watch { broadcaster: String },
    /// Join a chat room; stdin lines are sent as messages
    Chat { room: String },
}

fn parse_role(raw: &str) -> Result<Role, String> {
    match raw.to_ascii_lowercase().as_str() {
        "viewer" => Ok(Role::Viewer),
        "model" => Ok(Role::Model),
        "admin" => Ok(Role::Admin),
        other => Err(format!("unknown role {:?}", other)),
    }
}

#[tokio::main]
async fn main() {
    livecast_lib::init_tracing();
    let cli = Cli::parse();

    let config = ClientConfig {
        backend_url: cli.backend_url,
        token: cli.token,
        identity: UserIdentity {
            user_id: cli.user_id,
            username: cli.username,
            role: cli.role,
            model_room_id: cli.model_room,
        },
        ..Default::default()
    };

    let outcome = match cli.command {
        Command::Broadcast { quality } => livecast_lib::run_broadcast(config, quality)
            .await
            .map_err(|e| e.to_string()),
        Command::Watch { broadcaster } => livecast_lib::run_watch(config, &broadcaster)
            .await
            .map_err(|e| e.to_string()),
        Command::Chat { room } => livecast_lib::run_chat(config, &room)
            .await
            .map_err(|e| e.to_string()),
    };

    if let Err(e) = outcome {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
