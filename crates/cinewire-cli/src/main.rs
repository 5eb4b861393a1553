use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;

use cinewire_analyzer::EmotionAnalyzer;
use cinewire_channel::{session_endpoint, SessionChannel};
use cinewire_graph::{NodeRole, StoryGraph};
use cinewire_player::{
    NullFrameSource, PlaybackState, Player, PlayerConfig, PlayerHandle, PlayerNotice,
};
use config::{load_config, Config};

#[derive(Parser)]
#[command(name = "cinewire", version, about = "Emotion-adaptive narrative playback client")]
struct Cli {
    #[arg(long, default_value = "cinewire.yaml", help = "Config file path")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Connect to the director service and run a viewing session")]
    Start,
    #[command(about = "Validate the config file")]
    Validate,
    #[command(about = "Print the story graph, optionally marking a played path")]
    Graph {
        #[arg(
            long,
            value_delimiter = ',',
            help = "Comma-separated scene ids already played"
        )]
        played: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_dir = PathBuf::from("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "cinewire.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    match command {
        Commands::Validate => {
            let config = load_config(&cli.config)?;
            println!(
                "Config valid. endpoint: {}, genre: {}, analyzer: {}, telemetry every {}s.",
                session_endpoint(config.session.base_url.as_deref())?,
                config.session.genre,
                if config.analyzer.api_key.is_empty() {
                    "disabled"
                } else {
                    "enabled"
                },
                config.telemetry.interval_seconds,
            );
        }
        Commands::Graph { played } => {
            print_graph(&StoryGraph::the_inheritance(), &played);
        }
        Commands::Start => {
            let config = load_config(&cli.config)?;
            run_session(config).await?;
        }
    }

    Ok(())
}

async fn run_session(config: Config) -> Result<()> {
    let endpoint = session_endpoint(config.session.base_url.as_deref())?;
    tracing::info!(endpoint = %endpoint, "starting viewing session");

    let (events_tx, events_rx) = mpsc::channel(64);
    let channel = SessionChannel::new(endpoint, events_tx);
    channel.connect().await;

    let analyzer = Arc::new(EmotionAnalyzer::new(
        config.analyzer.api_key.clone(),
        config.analyzer.model.clone(),
    ));
    let player = Player::spawn(
        PlayerConfig {
            genre: config.session.genre.clone(),
            telemetry_interval: Duration::from_secs(config.telemetry.interval_seconds),
            ..PlayerConfig::default()
        },
        Arc::new(channel.clone()),
        analyzer,
        Arc::new(NullFrameSource),
        events_rx,
    );

    let mut notices = player.subscribe_notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            match notice {
                PlayerNotice::Deciding => tracing::info!("the director is deciding"),
                PlayerNotice::DirectorError(message) => {
                    tracing::warn!(message = %message, "director reported an error")
                }
            }
        }
    });

    player.start().await;
    watch_session(&player).await;

    channel.disconnect();
    Ok(())
}

async fn watch_session(player: &PlayerHandle) {
    let graph = StoryGraph::the_inheritance();
    let mut view = player.view_watch();
    let mut last_state = PlaybackState::Idle;
    let mut last_scene: Option<String> = None;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    tracing::info!("interrupted, resetting session");
                    player.reset().await;
                }
                return;
            }
            changed = view.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }

        let current = view.borrow_and_update().clone();
        if current.state != last_state {
            tracing::info!(state = ?current.state, "playback state changed");
            last_state = current.state;
        }
        let scene = current.assets.as_ref().map(|a| a.scene_id.clone());
        if scene != last_scene {
            if let Some(assets) = &current.assets {
                tracing::info!(
                    scene = %assets.scene_id,
                    chapter = %assets.chapter,
                    "{}",
                    assets.narration_text
                );
            }
            last_scene = scene;
        }

        if current.state == PlaybackState::Ended {
            print_credits(&current, &graph);
            return;
        }
    }
}

fn ending_title(ending_id: &str) -> &str {
    match ending_id {
        "ending_solve" => "The Truth Revealed",
        "ending_bittersweet" => "A Bittersweet Resolution",
        "ending_twist" => "Nothing Was As It Seemed",
        "ending_humorous" => "The Cat Wins",
        "ending_supernatural" => "The House Keeps Its Dead",
        other => other,
    }
}

fn print_credits(view: &cinewire_player::PlayerView, graph: &StoryGraph) {
    println!("\nYour film has concluded.");
    if let Some(ending) = &view.ending {
        println!("Ending: {}", ending_title(ending));
    }
    let mut history = cinewire_schema::EmotionHistory::new();
    for emotion in &view.history {
        history.push(*emotion);
    }
    if let Some(dominant) = history.dominant() {
        println!("Dominant emotion: {dominant}");
    }
    println!("Scenes witnessed:");
    for (idx, id) in view.scenes_played.iter().enumerate() {
        println!("  {:02} {}", idx + 1, id.replace('_', " "));
    }
    println!();
    print_graph(graph, &view.scenes_played);
}

fn print_graph(graph: &StoryGraph, played: &[String]) {
    let visited = graph.visited_nodes(played);
    let active = graph.active_edges(played);

    println!("nodes:");
    for node in graph.nodes() {
        let marker = if visited.contains(node.id.as_str()) {
            "*"
        } else {
            " "
        };
        let role = match node.role {
            NodeRole::Scene => "scene",
            NodeRole::Decision => "branch",
        };
        println!("  [{marker}] {:<6} {:<20} {}", role, node.id, node.label);
    }
    println!("edges:");
    for edge in graph.edges() {
        let marker = if active.contains(&(edge.from.as_str(), edge.to.as_str())) {
            "=>"
        } else {
            "--"
        };
        match &edge.trigger {
            Some(trigger) => {
                println!("  {} {} {} ({trigger})", edge.from, marker, edge.to)
            }
            None => println!("  {} {} {}", edge.from, marker, edge.to),
        }
    }
}
