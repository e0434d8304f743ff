mod announce;

use serenity::{
    async_trait,
    client::{Client, Context, EventHandler},
    framework::standard::{macros::group, StandardFramework},
    model::gateway::Ready,
    prelude::GatewayIntents,
};
use std::collections::HashMap;
use std::env;
use std::fs;
use tokio::signal;

use crate::announce::{AnnounceConfig, AnnounceConfigKey, ANNOUNCE_COMMAND};

// Command group declaration
#[group]
#[commands(announce)]
struct Announce;

// Event handler implementation
struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _: Context, ready: Ready) {
        println!("✅ Bot connected as {}!", ready.user.name);
    }
}

// Function to read configuration from botconfig.txt with multi-path fallback
fn load_bot_config() -> Result<HashMap<String, String>, String> {
    let config_paths = [
        "botconfig.txt",
        "../botconfig.txt",
        "../../botconfig.txt",
        "src/botconfig.txt",
    ];

    for config_path in &config_paths {
        match fs::read_to_string(config_path) {
            Ok(content) => {
                // Remove BOM if present
                let content = content.strip_prefix('\u{feff}').unwrap_or(&content);
                let mut config = HashMap::new();

                // Parse the config file line by line
                for line in content.lines() {
                    let line = line.trim();

                    // Skip empty lines and comments
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }

                    // Parse KEY=VALUE format
                    if let Some(equals_pos) = line.find('=') {
                        let key = line[..equals_pos].trim().to_string();
                        let value = line[equals_pos + 1..].trim().to_string();

                        // Set environment variable for compatibility
                        env::set_var(&key, &value);
                        config.insert(key, value);
                    }
                }

                println!("✅ Configuration loaded from {}", config_path);
                return Ok(config);
            }
            Err(_) => {
                // Try next path
                continue;
            }
        }
    }

    Err("No botconfig.txt file found in any expected location (., .., ../.., src/)".to_string())
}

#[tokio::main]
async fn main() {
    // Initialize logger - must be done before any logging calls
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("error"))
        .format_timestamp_secs()
        .init();

    // Load configuration from botconfig.txt; without the file, settings
    // are taken from the process environment instead
    if let Err(error) = load_bot_config() {
        println!("⚠️  {} - using process environment", error);
    }

    // Get Discord token from configuration
    let token = match env::var("DISCORD_TOKEN") {
        Ok(token) => {
            // Validate token is not placeholder
            if token == "YOUR_BOT_TOKEN_HERE" || token.is_empty() {
                log::error!("❌ DISCORD_TOKEN is set to placeholder value");
                eprintln!("❌ DISCORD_TOKEN is set to placeholder! Replace with your actual Discord bot token.");
                std::process::exit(1);
            }
            token
        }
        Err(_) => {
            log::error!("❌ DISCORD_TOKEN not found in botconfig.txt or the environment");
            eprintln!("❌ DISCORD_TOKEN not found in botconfig.txt or the environment!");
            std::process::exit(1);
        }
    };

    // Get command prefix from configuration
    let prefix = env::var("PREFIX").unwrap_or_else(|_| "!".to_string());

    // Parse announcement settings (default channel, announcer role, allowlist)
    let announce_config = match AnnounceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("❌ Invalid announce configuration: {}", e);
            eprintln!("❌ Invalid announce configuration: {}", e);
            std::process::exit(1);
        }
    };

    println!("🤖 Starting bot with prefix: '{}'", prefix);

    // Set up command framework
    let framework = StandardFramework::new()
        .configure(|c| {
            c.prefix(&prefix)
                .case_insensitivity(true)
                .no_dm_prefix(true)
                .with_whitespace(true)
        })
        .after(|_ctx, msg, command_name, result| {
            Box::pin(async move {
                match result {
                    Ok(()) => {}
                    Err(e) => {
                        log::error!(
                            "❌ Command '{}' failed for user {} ({}): {:?}",
                            command_name,
                            msg.author.name,
                            msg.author.id,
                            e
                        );
                    }
                }
            })
        })
        .group(&ANNOUNCE_GROUP);

    // Configure bot intents
    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    // Create and start client
    let mut client = match Client::builder(token, intents)
        .event_handler(Handler)
        .framework(framework)
        .await
    {
        Ok(client) => client,
        Err(e) => {
            log::error!("❌ Error creating Discord client: {:?}", e);
            eprintln!("❌ Error creating Discord client: {:?}", e);
            eprintln!("Check your token in botconfig.txt");
            std::process::exit(1);
        }
    };

    // Inject the announcement configuration for the command handler
    {
        let mut data = client.data.write().await;
        data.insert::<AnnounceConfigKey>(announce_config);
    }

    println!("🚀 Bot is running...");
    println!("💡 Press Ctrl+C to stop");
    tokio::select! {
        _ = signal::ctrl_c() => {
            println!("\n⏹️  Stopping bot gracefully...");
        }
        result = client.start() => {
            if let Err(why) = result {
                log::error!("❌ Client error: {:?}", why);
                eprintln!("❌ Client error: {:?}", why);
            }
        }
    }

    println!("✅ Bot stopped");
}
