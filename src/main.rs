use std::collections::HashSet;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use supportdesk::config::SyncConfig;
use supportdesk::db;
use supportdesk::frame::ErrorCode;
use supportdesk::model::{MessageId, Role};
use supportdesk::services::badge::UnreadBadge;
use supportdesk::services::inbox::{AdminInbox, unread_total};
use supportdesk::store::postgres::PgBackend;
use supportdesk::store::{Backend, ConversationFilter, ConversationSummary, StaticIdentity, StoreError};
use supportdesk::sync::{ChatSync, ChatView, ConversationHandle, SyncError};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing user id; pass --user or set SUPPORTDESK_USER_ID")]
    MissingUser,
    #[error("user {0} has no admin profile")]
    NotAdmin(Uuid),
    #[error("clearing is irreversible; re-run with --yes to confirm")]
    ClearNotConfirmed,
    #[error("database connect failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("stdin read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "supportdesk", about = "Student/admin realtime support chat")]
struct Cli {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Acting user (profiles.id).
    #[arg(long = "user", env = "SUPPORTDESK_USER_ID")]
    user_id: Option<Uuid>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat with support as the signed-in student.
    Student,
    /// Print the student's unread badge and follow it until Ctrl-C.
    Badge,
    Admin(AdminCommand),
}

#[derive(Args, Debug)]
struct AdminCommand {
    #[command(subcommand)]
    command: AdminSubcommand,
}

#[derive(Subcommand, Debug)]
enum AdminSubcommand {
    List {
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 0)]
        page: i64,
        /// Keep the first page on screen, re-listing on every change.
        #[arg(long, conflicts_with = "page")]
        follow: bool,
    },
    Chat {
        conversation_id: Uuid,
    },
    Clear {
        conversation_id: Uuid,
        #[arg(long)]
        yes: bool,
        /// Also delete the conversation row.
        #[arg(long)]
        delete_conversation: bool,
    },
    Lock {
        conversation_id: Uuid,
    },
    Unlock {
        conversation_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("supportdesk=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let user_id = cli.user_id.ok_or(CliError::MissingUser)?;
    let config = SyncConfig::from_env();
    let pool = db::init_pool(&cli.database_url).await?;
    let pg = Arc::new(PgBackend::new(pool).with_channel_capacity(config.channel_capacity));
    let backend = Backend::from_shared(Arc::new(StaticIdentity(Some(user_id))), pg.clone());

    match cli.command {
        Command::Student => {
            let sync = ChatSync::spawn(backend, Role::Student, config);
            let handle = sync.open_own().await?;
            tracing::info!(conversation_id = %handle.conversation_id(), "support chat open; /quit to leave");
            chat_loop(&sync, handle).await
        }
        Command::Badge => run_badge(&backend).await,
        Command::Admin(admin) => {
            if pg.profile_role(user_id).await? != Some(Role::Admin) {
                return Err(CliError::NotAdmin(user_id));
            }
            run_admin(backend, config, admin.command).await
        }
    }
}

async fn run_admin(backend: Backend, config: SyncConfig, command: AdminSubcommand) -> Result<(), CliError> {
    match command {
        AdminSubcommand::List { search, page, follow } => {
            let inbox = AdminInbox::new(backend.conversations.clone(), config.admin_list_limit);
            let filter = ConversationFilter { search };
            if !follow {
                print_listing(&inbox.page(&filter, page).await?);
                return Ok(());
            }

            let live = inbox.follow(backend.realtime.as_ref(), filter).await?;
            let mut rows = live.watch();
            print_listing(&live.current());
            loop {
                tokio::select! {
                    changed = rows.changed() => {
                        if changed.is_err() {
                            eprintln!("! live updates lost");
                            return Ok(());
                        }
                        println!();
                        print_listing(&rows.borrow_and_update());
                    }
                    _ = tokio::signal::ctrl_c() => return Ok(()),
                }
            }
        }
        AdminSubcommand::Chat { conversation_id } => {
            let sync = ChatSync::spawn(backend, Role::Admin, config);
            let handle = sync.open(conversation_id).await?;
            chat_loop(&sync, handle).await
        }
        AdminSubcommand::Clear { conversation_id, yes, delete_conversation } => {
            if !yes {
                return Err(CliError::ClearNotConfirmed);
            }
            let sync = ChatSync::spawn(backend, Role::Admin, config);
            let handle = sync.open(conversation_id).await?;
            wait_channel_ready(&sync).await;
            sync.clear(delete_conversation).await?;
            sync.close(handle).await?;
            // Broadcast delivery runs on its own task; give it a moment before exit.
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            println!("cleared {conversation_id}");
            Ok(())
        }
        AdminSubcommand::Lock { conversation_id } => set_closed(backend, config, conversation_id, true).await,
        AdminSubcommand::Unlock { conversation_id } => set_closed(backend, config, conversation_id, false).await,
    }
}

async fn set_closed(backend: Backend, config: SyncConfig, conversation_id: Uuid, closed: bool) -> Result<(), CliError> {
    let sync = ChatSync::spawn(backend, Role::Admin, config);
    let handle = sync.open(conversation_id).await?;
    sync.set_closed(closed).await?;
    sync.close(handle).await?;
    println!("{conversation_id} {}", if closed { "locked" } else { "unlocked" });
    Ok(())
}

fn print_listing(rows: &[ConversationSummary]) {
    for row in rows {
        let c = &row.conversation;
        println!(
            "{}  {:<24} {:<10} unread={:<3} {}{}",
            c.id,
            row.student_name.as_deref().unwrap_or("-"),
            row.student_code.as_deref().unwrap_or("-"),
            c.unread_admin,
            if c.is_closed { "[closed] " } else { "" },
            c.last_message_body.as_deref().unwrap_or(""),
        );
    }
    println!("{} conversations, {} unread", rows.len(), unread_total(rows));
}

async fn run_badge(backend: &Backend) -> Result<(), CliError> {
    let badge = UnreadBadge::start(backend).await?;
    let mut unread = badge.watch();
    println!("unread: {}", badge.current());
    if badge.conversation_id().is_none() {
        return Ok(());
    }
    loop {
        tokio::select! {
            changed = unread.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                println!("unread: {}", *unread.borrow_and_update());
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn wait_channel_ready(sync: &ChatSync) {
    let mut view = sync.view();
    let ready = view.wait_for(|v| v.channel_ready || v.error.is_some());
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), ready).await;
    let _ = sync.barrier().await;
}

async fn chat_loop(sync: &ChatSync, handle: ConversationHandle) -> Result<(), CliError> {
    let printer = tokio::spawn(print_view(sync.view()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {}
            "/quit" => break,
            "/read" => sync.mark_read().await?,
            "/dismiss" => sync.dismiss_error().await?,
            body => {
                if let Err(e) = sync.send(body).await {
                    eprintln!("! [{}] {e}", e.error_code());
                }
            }
        }
    }

    sync.close(handle).await?;
    printer.abort();
    Ok(())
}

/// Print confirmed messages as they appear, plus error changes.
async fn print_view(mut rx: watch::Receiver<ChatView>) {
    let mut shown: HashSet<MessageId> = HashSet::new();
    let mut last_error: Option<String> = None;
    loop {
        {
            let view = rx.borrow_and_update();
            if view.messages.is_empty() && !shown.is_empty() {
                println!("-- conversation cleared --");
                shown.clear();
            }
            for m in view.messages.iter().filter(|m| !m.optimistic) {
                if shown.insert(m.id()) {
                    println!("[{}] {}", m.message.sender_role, m.message.body);
                }
            }
            if view.error != last_error {
                if let Some(e) = &view.error {
                    eprintln!("! {e}");
                }
                last_error.clone_from(&view.error);
            }
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}
