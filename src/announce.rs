// announce.rs - Announcement command module
// Implements the !announce command: permission check, target channel
// resolution, attachment forwarding and optional publish to followers.

use once_cell::sync::Lazy;
use regex::Regex;
use serenity::{
    client::Context,
    framework::standard::{macros::command, Args, CommandResult},
    model::{
        channel::{AttachmentType, ChannelType, GuildChannel, Message},
        id::{ChannelId, GuildId, RoleId, UserId},
        permissions::Permissions,
    },
    prelude::TypeMapKey,
};
use std::collections::HashSet;
use std::env;
use thiserror::Error;

/// Discord's upload cap for servers without a boost level, in bytes.
pub const MAX_BASIC_UPLOAD: u64 = 8 * 1024 * 1024;

static CHANNEL_MENTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^<#(\d+)>$").unwrap());
static BROADCAST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"@everyone|@here").unwrap());
static ROLE_MENTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<@&\d+>").unwrap());

/// Announcement settings, parsed once at startup from the environment
/// (seeded by botconfig.txt) and injected into the client data map.
#[derive(Debug, Clone, Default)]
pub struct AnnounceConfig {
    pub default_channel_id: Option<ChannelId>,
    pub announcer_role_id: Option<RoleId>,
    pub allowlist: HashSet<UserId>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is not a valid Discord id: {value:?}")]
    InvalidId { name: &'static str, value: String },
}

impl AnnounceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            default_channel_id: parse_optional_id("ANNOUNCE_CHANNEL_ID")?.map(ChannelId),
            announcer_role_id: parse_optional_id("ANNOUNCER_ROLE_ID")?.map(RoleId),
            allowlist: parse_allowlist(&env::var("ANNOUNCE_ALLOWLIST").unwrap_or_default())?,
        })
    }
}

fn parse_optional_id(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(raw) => {
            let raw = raw.trim();
            if raw.is_empty() {
                return Ok(None);
            }
            raw.parse::<u64>()
                .map(Some)
                .map_err(|_| ConfigError::InvalidId { name, value: raw.to_string() })
        }
        Err(_) => Ok(None),
    }
}

/// Parse the comma-separated ANNOUNCE_ALLOWLIST value. Entries are
/// trimmed and empty entries are dropped.
pub fn parse_allowlist(raw: &str) -> Result<HashSet<UserId>, ConfigError> {
    let mut ids = HashSet::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let id = entry.parse::<u64>().map_err(|_| ConfigError::InvalidId {
            name: "ANNOUNCE_ALLOWLIST",
            value: entry.to_string(),
        })?;
        ids.insert(UserId(id));
    }
    Ok(ids)
}

// TypeMap key for the announcement configuration
pub struct AnnounceConfigKey;
impl TypeMapKey for AnnounceConfigKey {
    type Value = AnnounceConfig;
}

/// Named capability predicates over the bot's effective permissions in
/// one channel, so the command body never touches raw bitflags.
#[derive(Debug, Clone, Copy)]
pub struct ChannelCaps {
    perms: Permissions,
}

impl ChannelCaps {
    pub fn new(perms: Permissions) -> Self {
        Self { perms }
    }

    pub fn can_send(&self) -> bool {
        self.perms.contains(Permissions::SEND_MESSAGES)
    }

    pub fn can_attach_files(&self) -> bool {
        self.perms.contains(Permissions::ATTACH_FILES)
    }

    pub fn can_mention_everyone(&self) -> bool {
        self.perms.contains(Permissions::MENTION_EVERYONE)
    }
}

/// Result of splitting the command text into an optional explicit
/// target channel and the announcement content.
#[derive(Debug)]
pub struct ParsedAnnounce {
    pub channel: Option<ChannelId>,
    pub content: String,
}

/// Split the argument text on whitespace. A leading `<#id>` mention is
/// the explicit target; everything else, joined with single spaces, is
/// the content.
pub fn parse_target_and_content(text: &str) -> ParsedAnnounce {
    let mut words = text.split_whitespace();
    if let Some(first) = words.next() {
        if let Some(caps) = CHANNEL_MENTION_RE.captures(first) {
            if let Ok(id) = caps[1].parse::<u64>() {
                return ParsedAnnounce {
                    channel: Some(ChannelId(id)),
                    content: words.collect::<Vec<_>>().join(" "),
                };
            }
        }
    }
    ParsedAnnounce {
        channel: None,
        content: text.split_whitespace().collect::<Vec<_>>().join(" "),
    }
}

/// True when the content would ping @everyone/@here or a role, which
/// requires the Mention Everyone permission in the target channel.
pub fn wants_broadcast_mention(content: &str) -> bool {
    BROADCAST_RE.is_match(content) || ROLE_MENTION_RE.is_match(content)
}

pub fn is_announcement_channel_name(name: &str) -> bool {
    matches!(name.to_lowercase().as_str(), "announcement" | "announcements")
}

#[command]
#[only_in(guilds)]
/// Main !announce command handler
/// Usage: !announce [#channel] <message> (attachments may substitute
/// for or accompany the text)
pub async fn announce(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    if let Err(e) = run_announce(ctx, msg, &args).await {
        log::error!(
            "[ANNOUNCE] Announcement failed for user {} ({}): {}",
            msg.author.name,
            msg.author.id,
            e
        );
        // Best-effort error reply; nothing left to do if this fails too
        let _ = msg
            .reply(ctx, "Something went wrong while sending the announcement.")
            .await;
    }
    Ok(())
}

async fn run_announce(
    ctx: &Context,
    msg: &Message,
    args: &Args,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let guild_id = match msg.guild_id {
        Some(id) => id,
        None => return Ok(()),
    };

    let config = {
        let data = ctx.data.read().await;
        data.get::<AnnounceConfigKey>()
            .cloned()
            .ok_or("announce configuration not initialised")?
    };

    // Authorization comes before any channel resolution: guild owner,
    // Manage Messages, the configured announcer role, or the allowlist.
    let member = msg.member(ctx).await?;
    let is_owner = match msg.guild(&ctx.cache) {
        Some(guild) => guild.owner_id == msg.author.id,
        None => guild_id.to_partial_guild(&ctx.http).await?.owner_id == msg.author.id,
    };
    let has_manage = member
        .permissions(&ctx.cache)
        .map(|p| p.contains(Permissions::MANAGE_MESSAGES))
        .unwrap_or(false);
    let has_announcer_role = config
        .announcer_role_id
        .map(|role| member.roles.contains(&role))
        .unwrap_or(false);
    let is_allowlisted = config.allowlist.contains(&msg.author.id);

    if !is_owner && !has_manage && !has_announcer_role && !is_allowlisted {
        msg.reply(ctx, "You don't have permission to use this command.")
            .await?;
        return Ok(());
    }

    let text = args.message().trim();
    if text.is_empty() && msg.attachments.is_empty() {
        msg.reply(
            ctx,
            "Usage: `!announce [#channel] <message>` (you can also attach files/images)",
        )
        .await?;
        return Ok(());
    }

    let parsed = parse_target_and_content(text);
    let target = match resolve_target(ctx, guild_id, parsed.channel, &config).await {
        Some(channel) => channel,
        None => {
            msg.reply(
                ctx,
                "Target channel not found. Use a channel mention or set ANNOUNCE_CHANNEL_ID in botconfig.txt.",
            )
            .await?;
            return Ok(());
        }
    };

    let bot_id = ctx.cache.current_user_id();
    let caps = ChannelCaps::new(target.permissions_for_user(&ctx.cache, bot_id)?);
    if !caps.can_send() {
        msg.reply(
            ctx,
            "I can't send messages to the target channel (missing Send Messages permission).",
        )
        .await?;
        return Ok(());
    }

    // Size check runs over every attachment before anything is sent,
    // so an oversized file never produces a partial announcement.
    let mut files: Vec<(String, String)> = Vec::new();
    for attachment in &msg.attachments {
        if attachment.size > MAX_BASIC_UPLOAD {
            msg.reply(
                ctx,
                format!(
                    "Attachment \"{}\" is too large (>8MB). Please use smaller files or host externally.",
                    attachment.filename
                ),
            )
            .await?;
            return Ok(());
        }
        files.push((attachment.url.clone(), attachment.filename.clone()));
    }

    if !files.is_empty() && !caps.can_attach_files() {
        msg.reply(
            ctx,
            "I don't have permission to attach files in the target channel (Attach Files missing).",
        )
        .await?;
        return Ok(());
    }

    if wants_broadcast_mention(&parsed.content) && !caps.can_mention_everyone() {
        msg.reply(
            ctx,
            "I don't have permission to mention everyone/roles in that channel.",
        )
        .await?;
        return Ok(());
    }

    let mut uploads = Vec::with_capacity(files.len());
    for (url, filename) in &files {
        let data = download_attachment(url).await?;
        uploads.push(AttachmentType::Bytes {
            data: data.into(),
            filename: filename.clone(),
        });
    }

    println!(
        "[ANNOUNCE] {} ({}) announcing to #{} ({})",
        msg.author.name, msg.author.id, target.name, target.id
    );

    let content = if parsed.content.is_empty() && uploads.is_empty() {
        "(empty announcement)".to_string()
    } else {
        parsed.content.clone()
    };

    let sent = target
        .id
        .send_message(&ctx.http, |m| {
            m.content(&content);
            for upload in uploads {
                m.add_file(upload);
            }
            // User mentions always parse; roles/everyone only when the
            // bot holds Mention Everyone in the target channel. This is
            // a ceiling, not a per-message toggle.
            m.allowed_mentions(|am| {
                am.parse(serenity::builder::ParseValue::Users);
                if caps.can_mention_everyone() {
                    am.parse(serenity::builder::ParseValue::Roles);
                    am.parse(serenity::builder::ParseValue::Everyone);
                }
                am
            });
            m
        })
        .await?;

    if target.kind == ChannelType::News {
        match sent.crosspost(&ctx.http).await {
            Ok(_) => {
                msg.reply(ctx, "Announcement sent and published.").await?;
            }
            Err(e) => {
                // Non-fatal: the announcement is already in the channel
                log::error!(
                    "[ANNOUNCE] Failed to publish announcement in #{} ({}): {}",
                    target.name,
                    target.id,
                    e
                );
                msg.reply(
                    ctx,
                    "Announcement sent, but failed to publish (missing publish permission?).",
                )
                .await?;
            }
        }
    } else {
        msg.reply(ctx, "Announcement sent.").await?;
    }

    Ok(())
}

/// Resolve the target channel: explicit mention, then the configured
/// default, then a channel named announcement/announcements.
async fn resolve_target(
    ctx: &Context,
    guild_id: GuildId,
    explicit: Option<ChannelId>,
    config: &AnnounceConfig,
) -> Option<GuildChannel> {
    if let Some(id) = explicit {
        return guild_channel(ctx, guild_id, id).await;
    }
    if let Some(id) = config.default_channel_id {
        return guild_channel(ctx, guild_id, id).await;
    }
    let channels = guild_id.channels(&ctx.http).await.ok()?;
    channels
        .into_values()
        .find(|channel| is_announcement_channel_name(&channel.name))
}

/// Cache lookup with HTTP fallback. The channel must belong to the
/// invoking guild.
async fn guild_channel(ctx: &Context, guild_id: GuildId, id: ChannelId) -> Option<GuildChannel> {
    let channel = match ctx.cache.guild_channel(id) {
        Some(channel) => channel,
        None => ctx.http.get_channel(id.0).await.ok()?.guild()?,
    };
    if channel.guild_id == guild_id {
        Some(channel)
    } else {
        None
    }
}

// Helper function to download attachment data into memory for re-upload
async fn download_attachment(url: &str) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
    let client = reqwest::Client::new();
    let response = client.get(url).send().await?;

    if !response.status().is_success() {
        return Err(format!("HTTP error: {}", response.status()).into());
    }

    let bytes = response.bytes().await?;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_channel_mention() {
        let parsed = parse_target_and_content("<#123> hello");
        assert_eq!(parsed.channel, Some(ChannelId(123)));
        assert_eq!(parsed.content, "hello");
    }

    #[test]
    fn test_mention_only_is_empty_content() {
        let parsed = parse_target_and_content("<#123>");
        assert_eq!(parsed.channel, Some(ChannelId(123)));
        assert_eq!(parsed.content, "");
    }

    #[test]
    fn test_non_leading_mention_is_content() {
        let parsed = parse_target_and_content("hello <#123>");
        assert_eq!(parsed.channel, None);
        assert_eq!(parsed.content, "hello <#123>");
    }

    #[test]
    fn test_whitespace_collapses_to_single_spaces() {
        let parsed = parse_target_and_content("<#42>   big   news\ttoday");
        assert_eq!(parsed.channel, Some(ChannelId(42)));
        assert_eq!(parsed.content, "big news today");
    }

    #[test]
    fn test_empty_text() {
        let parsed = parse_target_and_content("");
        assert_eq!(parsed.channel, None);
        assert_eq!(parsed.content, "");
    }

    #[test]
    fn test_allowlist_trims_and_skips_empty_entries() {
        let ids = parse_allowlist(" 1, 2 ,,3, ").unwrap();
        let expected: HashSet<UserId> = [UserId(1), UserId(2), UserId(3)].into_iter().collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_empty_allowlist() {
        assert!(parse_allowlist("").unwrap().is_empty());
    }

    #[test]
    fn test_allowlist_rejects_non_numeric_entries() {
        assert!(parse_allowlist("1,not-an-id").is_err());
    }

    #[test]
    fn test_broadcast_mention_detection() {
        assert!(wants_broadcast_mention("hey @everyone big news"));
        assert!(wants_broadcast_mention("@here quick one"));
        assert!(wants_broadcast_mention("ping <@&456789> please"));
        assert!(!wants_broadcast_mention("hello world"));
        assert!(!wants_broadcast_mention("hi <@123456>"));
    }

    #[test]
    fn test_announcement_channel_names() {
        assert!(is_announcement_channel_name("announcements"));
        assert!(is_announcement_channel_name("announcement"));
        assert!(is_announcement_channel_name("Announcements"));
        assert!(!is_announcement_channel_name("general"));
        assert!(!is_announcement_channel_name("announcements-archive"));
    }

    #[test]
    fn test_upload_limit_is_eight_mib() {
        assert_eq!(MAX_BASIC_UPLOAD, 8 * 1024 * 1024);
        // A 9 MiB file is over the limit; exactly 8 MiB is allowed
        assert!(9 * 1024 * 1024 > MAX_BASIC_UPLOAD);
        assert!(8 * 1024 * 1024 <= MAX_BASIC_UPLOAD);
    }

    #[test]
    fn test_channel_caps_predicates() {
        let send_only = ChannelCaps::new(Permissions::SEND_MESSAGES);
        assert!(send_only.can_send());
        assert!(!send_only.can_attach_files());
        assert!(!send_only.can_mention_everyone());

        let full = ChannelCaps::new(
            Permissions::SEND_MESSAGES | Permissions::ATTACH_FILES | Permissions::MENTION_EVERYONE,
        );
        assert!(full.can_send());
        assert!(full.can_attach_files());
        assert!(full.can_mention_everyone());

        let none = ChannelCaps::new(Permissions::empty());
        assert!(!none.can_send());
    }
}
