use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use nepex::activity::ActivityLog;
use nepex::ai::{AiGateway, GeminiGateway};
use nepex::clock::now_millis;
use nepex::config::AppConfig;
use nepex::prompts::STARTER_PROMPTS;
use nepex::conversations::ConversationStore;
use nepex::session::{LoginOutcome, Session};
use nepex::settings::{SettingsPatch, SettingsStore, spawn_refill_timer, spawn_settings_sync};
use nepex::storage::{FileStorage, KeyValueStore};
use nepex::types::{Attachment, Persona, Sender, Theme};
use nepex::users::UserRegistry;
use nepex::{ChatSession, GenerationOutcome};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
Commands:
  /new                      start a conversation
  /list                     list conversations
  /open <n>                 switch to conversation n
  /delete <n>               delete conversation n
  /edit <n> <text>          rewrite message n of the active conversation
  /regen                    regenerate the last response
  /attach <path> [text]     send a file with optional text
  /say                      synthesize the last reply to nepex-speech.pcm
  /credits                  show balance and refill countdown
  /persona <name>           default | concise | tutor | developer | creative
  /theme <name>             light | dark | system
  /sound <on|off>           toggle sound effects
  /login <email> <password> sign in
  /logout                   sign out and clear history
  /users                    list registered users
  /stats                    user and message totals
  /block <email>            toggle a user's blocked flag
  /logs [n]                 show recent activity
  /maintenance <on|off>     toggle maintenance mode
  /key <api-key>            cache an API credential
  /quit                     exit
Anything else is sent to the active conversation; `/imagine <prompt>` makes an image.";

fn load_dotenv() {
    if let Err(err) = dotenvy::dotenv()
        && !err.not_found()
    {
        eprintln!("failed to read .env: {err}");
    }
}

struct Host {
    chat: ChatSession,
    session: Session,
    users: UserRegistry,
    data_dir: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nepex=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::from_env();
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let storage: Arc<dyn KeyValueStore> = Arc::new(FileStorage::new(&config.data_dir));

    let settings = Arc::new(Mutex::new(SettingsStore::load(storage.clone(), now_millis())));
    let _refill = spawn_refill_timer(settings.clone(), config.refill_check_interval);
    let _sync = spawn_settings_sync(settings.clone(), storage.subscribe());

    let conversations = Arc::new(Mutex::new(ConversationStore::load(storage.clone())));
    let activity = Arc::new(Mutex::new(ActivityLog::load(storage.clone())));
    let gateway: Arc<dyn AiGateway> =
        Arc::new(GeminiGateway::new(config.gateway.clone()).with_credential_slot(storage.clone()));

    let chat = ChatSession::new(conversations, settings, activity, gateway)
        .with_credit_enforcement(config.enforce_credits);
    let mut host = Host {
        chat,
        session: Session::new(storage.clone(), config.admin.clone()),
        users: UserRegistry::load(storage),
        data_dir: config.data_dir.clone(),
    };

    if host.session.is_locked_out() {
        println!("Nepex is under maintenance. Only an admin can sign in (/login).");
    } else if !host.session.onboarding_complete() {
        println!("Welcome to Nepex. Sign in with /login <email> <password>, or just start typing.");
        println!("Try one of these:");
        for prompt in STARTER_PROMPTS {
            println!("  {prompt}");
        }
    }
    println!("Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = host.handle(line).await {
            println!("! {err}");
        }
    }
    Ok(())
}

impl Host {
    async fn handle(&mut self, line: &str) -> Result<()> {
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        if self.session.is_locked_out() && command != "/login" && command != "/help" {
            println!("Nepex is under maintenance.");
            return Ok(());
        }

        match command {
            "/help" => println!("{HELP}"),
            "/new" => {
                let conversation = self.chat.conversations().create_conversation();
                println!("started {}", conversation.title);
            }
            "/list" => self.list_conversations(),
            "/open" => {
                let id = self.conversation_at(rest)?;
                self.chat.conversations().select_conversation(&id);
                self.print_active();
            }
            "/delete" => {
                let id = self.conversation_at(rest)?;
                self.chat.conversations().delete_conversation(&id);
                self.list_conversations();
            }
            "/edit" => {
                let (index, text) = rest.split_once(' ').context("usage: /edit <n> <text>")?;
                let (conversation_id, message_id) = self.message_at(index)?;
                let outcome = self
                    .chat
                    .edit_message(&conversation_id, &message_id, text)
                    .await?;
                self.report(outcome);
            }
            "/regen" => {
                let conversation_id = self.active_id()?;
                let outcome = self.chat.regenerate(&conversation_id).await?;
                self.report(outcome);
            }
            "/attach" => {
                let (path, text) = rest.split_once(' ').unwrap_or((rest, ""));
                let attachment = read_attachment(Path::new(path))?;
                self.send(text, Some(attachment)).await?;
            }
            "/say" => self.say().await?,
            "/credits" => {
                let settings = self.chat.settings();
                let now = now_millis();
                println!(
                    "{} credits, refill: {}",
                    settings.get().credits,
                    settings.refill_countdown(now)
                );
            }
            "/persona" => {
                let persona = Persona::parse(rest).context("unknown persona")?;
                self.chat.settings().update(&SettingsPatch {
                    persona: Some(persona),
                    ..Default::default()
                });
                println!("persona: {}", persona.as_str());
            }
            "/theme" => {
                let theme = Theme::parse(rest).context("unknown theme")?;
                self.chat.settings().update(&SettingsPatch {
                    theme: Some(theme),
                    ..Default::default()
                });
            }
            "/sound" => {
                let enabled = match rest {
                    "on" => true,
                    "off" => false,
                    _ => anyhow::bail!("usage: /sound <on|off>"),
                };
                self.chat.settings().update(&SettingsPatch {
                    sound_effects: Some(enabled),
                    ..Default::default()
                });
                println!("sound effects: {rest}");
            }
            "/login" => {
                let (email, password) = rest.split_once(' ').unwrap_or((rest, ""));
                let outcome = self.session.login(
                    email,
                    password,
                    &mut self.users,
                    &mut self.chat.activity(),
                )?;
                match outcome {
                    LoginOutcome::Admin => println!("signed in as admin"),
                    LoginOutcome::User(user) => println!("signed in as {}", user.email),
                }
            }
            "/logout" => {
                self.session.logout(&mut self.chat.activity());
                self.chat.conversations().reset();
                println!("signed out");
            }
            "/users" => {
                for user in self.users.users() {
                    let state = if user.is_blocked { "blocked" } else { "active" };
                    println!("{}  {state}", user.email);
                }
            }
            "/stats" => {
                self.require_admin()?;
                println!(
                    "{} users, {} messages",
                    self.users.len(),
                    self.chat.conversations().total_message_count()
                );
            }
            "/block" => {
                self.require_admin()?;
                let id = self
                    .users
                    .find_by_email(rest)
                    .map(|u| u.id.clone())
                    .context("unknown user")?;
                if let Some(blocked) = self.users.toggle_blocked(&id) {
                    println!("{rest}: {}", if blocked { "blocked" } else { "unblocked" });
                }
            }
            "/logs" => {
                self.require_admin()?;
                let limit = rest.parse().unwrap_or(20);
                for entry in self.chat.activity().entries().take(limit) {
                    println!(
                        "{} {:?} {} {}",
                        entry.timestamp,
                        entry.kind,
                        entry.details,
                        entry.user_email.as_deref().unwrap_or("-")
                    );
                }
            }
            "/maintenance" => {
                self.require_admin()?;
                self.session.set_maintenance_mode(rest == "on");
            }
            "/key" => {
                self.session.set_api_key(rest);
                println!("credential cached");
            }
            _ => self.send(line, None).await?,
        }
        Ok(())
    }

    async fn send(&self, text: &str, attachment: Option<Attachment>) -> Result<()> {
        let conversation_id = self.active_id()?;
        let outcome = self
            .chat
            .send_message(&conversation_id, text, attachment)
            .await?;
        self.report(outcome);
        Ok(())
    }

    async fn say(&self) -> Result<()> {
        let text = self
            .chat
            .conversations()
            .active()
            .and_then(|c| c.messages.iter().rev().find(|m| m.sender == Sender::Assistant))
            .map(|m| m.text.clone())
            .context("nothing to read aloud")?;
        let Some(audio) = self.chat.speak(&text).await else {
            println!("speech unavailable");
            return Ok(());
        };
        let path = self.data_dir.join("nepex-speech.pcm");
        std::fs::write(&path, STANDARD.decode(audio)?)?;
        println!("wrote {}", path.display());
        Ok(())
    }

    fn report(&self, outcome: GenerationOutcome) {
        match outcome {
            GenerationOutcome::Skipped => println!("(still generating, nothing sent)"),
            GenerationOutcome::Completed { message_id } | GenerationOutcome::Failed { message_id } => {
                let store = self.chat.conversations();
                let Some(message) = store
                    .active()
                    .and_then(|c| c.messages.iter().find(|m| m.id == message_id))
                else {
                    return;
                };
                match &message.attachment {
                    Some(attachment) => println!("nepex: [{}]", attachment.name),
                    None => println!("nepex: {}", message.text),
                }
            }
        }
    }

    fn list_conversations(&self) {
        let store = self.chat.conversations();
        for (i, conversation) in store.conversations().iter().enumerate() {
            let marker = if store.active_id() == Some(conversation.id.as_str()) {
                "*"
            } else {
                " "
            };
            println!(
                "{marker}{i:>3}  {}  ({} messages)",
                conversation.title,
                conversation.messages.len()
            );
        }
    }

    fn print_active(&self) {
        let store = self.chat.conversations();
        let Some(conversation) = store.active() else {
            return;
        };
        println!("== {}", conversation.title);
        for (i, message) in conversation.messages.iter().enumerate() {
            let who = match message.sender {
                Sender::User => "you",
                Sender::Assistant => "nepex",
            };
            println!("{i:>3} {who}: {}", message.text);
        }
    }

    fn active_id(&self) -> Result<String> {
        self.chat
            .conversations()
            .active_id()
            .map(str::to_string)
            .context("no active conversation")
    }

    fn conversation_at(&self, index: &str) -> Result<String> {
        let index: usize = index.parse().context("expected a conversation number")?;
        self.chat
            .conversations()
            .conversations()
            .get(index)
            .map(|c| c.id.clone())
            .context("no such conversation")
    }

    fn message_at(&self, index: &str) -> Result<(String, String)> {
        let index: usize = index.parse().context("expected a message number")?;
        let store = self.chat.conversations();
        let conversation = store.active().context("no active conversation")?;
        let message = conversation
            .messages
            .get(index)
            .context("no such message")?;
        Ok((conversation.id.clone(), message.id.clone()))
    }

    fn require_admin(&self) -> Result<()> {
        if !self.session.is_admin() {
            anyhow::bail!("admin only");
        }
        Ok(())
    }
}

fn read_attachment(path: &Path) -> Result<Attachment> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());
    if mime.type_() != mime_guess::mime::IMAGE {
        warn!(mime = %mime, "non-image attachment");
    }
    Ok(Attachment::from_bytes(&bytes, mime.essence_str(), name))
}
