use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use picvault::compress::{find_preset, presets};
use picvault::db::{PresetSelection, SettingsStore};
use picvault::pipeline::content_id;
use picvault::tasks::{BatchRunner, MAX_CONCURRENCY, MIN_CONCURRENCY};
use picvault::{logging, Config, Database, IngestOptions, Pipeline, RecycleBin, Reorganizer, Tier};

enum Command {
    Ingest {
        file: PathBuf,
        id: Option<String>,
        chat: String,
        message: Option<String>,
        preset: Option<String>,
    },
    Show {
        id: String,
        original: bool,
        out: Option<PathBuf>,
    },
    Delete { id: String },
    Restore { id: String },
    Batch {
        preset: String,
        concurrency: Option<usize>,
        ids: Vec<String>,
    },
    Reorganize,
    TrashList,
    TrashPurge { id: String },
    TrashClear,
    TrashSweep { days: Option<u32> },
    Presets,
    SettingsShow,
    SettingsSet { preset: String },
    Stats,
}

struct Args {
    config_path: Option<PathBuf>,
    command: Command,
}

fn usage_error(msg: &str) -> ! {
    eprintln!("Error: {}", msg);
    eprintln!("Run `picvault --help` for usage.");
    std::process::exit(1);
}

/// Value following a flag at `args[*i]`, advancing `i` past it.
fn flag_value(args: &[String], i: &mut usize) -> String {
    if *i + 1 < args.len() {
        *i += 1;
        args[*i].clone()
    } else {
        usage_error(&format!("{} requires a value", args[*i]));
    }
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut positional = Vec::new();
    let mut flags: Vec<(String, Option<String>)> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("picvault {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                config_path = Some(PathBuf::from(flag_value(&args, &mut i)));
            }
            "--original" => flags.push(("original".to_string(), None)),
            "--id" | "--chat" | "--message" | "--preset" | "--out" => {
                let name = args[i].trim_start_matches('-').to_string();
                let value = flag_value(&args, &mut i);
                flags.push((name, Some(value)));
            }
            arg if arg.starts_with('-') => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let flag = |name: &str| {
        flags
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.clone())
    };
    let has_flag = |name: &str| flags.iter().any(|(n, _)| n == name);
    let arg = |idx: usize, what: &str| -> String {
        positional
            .get(idx)
            .cloned()
            .unwrap_or_else(|| usage_error(&format!("missing {}", what)))
    };

    let Some(name) = positional.first() else {
        print_help();
        std::process::exit(1);
    };

    let command = match name.as_str() {
        "ingest" => Command::Ingest {
            file: PathBuf::from(arg(1, "image file")),
            id: flag("id"),
            chat: flag("chat").unwrap_or_else(|| "cli".to_string()),
            message: flag("message"),
            preset: flag("preset"),
        },
        "show" => Command::Show {
            id: arg(1, "image id"),
            original: has_flag("original"),
            out: flag("out").map(PathBuf::from),
        },
        "delete" => Command::Delete { id: arg(1, "image id") },
        "restore" => Command::Restore { id: arg(1, "image id") },
        "batch" => {
            let concurrency = positional.get(2).map(|s| {
                s.parse()
                    .unwrap_or_else(|_| usage_error(&format!("invalid concurrency: {}", s)))
            });
            Command::Batch {
                preset: arg(1, "preset name"),
                concurrency,
                ids: positional.iter().skip(3).cloned().collect(),
            }
        }
        "reorganize" => Command::Reorganize,
        "trash" => match positional.get(1).map(String::as_str) {
            Some("list") | None => Command::TrashList,
            Some("purge") => Command::TrashPurge { id: arg(2, "image id") },
            Some("clear") => Command::TrashClear,
            Some("sweep") => Command::TrashSweep {
                days: positional.get(2).map(|s| {
                    s.parse()
                        .unwrap_or_else(|_| usage_error(&format!("invalid day count: {}", s)))
                }),
            },
            Some(other) => usage_error(&format!("unknown trash command: {}", other)),
        },
        "presets" => Command::Presets,
        "settings" => match positional.get(1).map(String::as_str) {
            Some("show") | None => Command::SettingsShow,
            Some("set") => Command::SettingsSet { preset: arg(2, "preset name") },
            Some(other) => usage_error(&format!("unknown settings command: {}", other)),
        },
        "stats" => Command::Stats,
        other => usage_error(&format!("unknown command: {}", other)),
    };

    Args {
        config_path,
        command,
    }
}

fn print_help() {
    println!(
        r#"picvault - two-tier image storage and compression

USAGE:
    picvault [OPTIONS] <COMMAND>

COMMANDS:
    ingest <FILE> [--id ID] [--chat CHAT] [--message MSG] [--preset NAME]
                                Store an image and its web-use copy
    show <ID> [--original] [--out PATH]
                                Print a stored record (web-use copy by default)
    delete <ID>                 Move both copies of an image to the recycle bin
    restore <ID>                Put a recycled record back into its tier
    batch <PRESET> [N] [IDS...] Recompress originals with N workers ({min}-{max});
                                all originals when no ids are given
    reorganize                  Deduplicate images per chat
    trash [list]                List recycled images, newest first
    trash purge <ID>            Permanently delete one recycled image
    trash clear                 Empty the recycle bin
    trash sweep [DAYS]          Purge entries older than DAYS (default from config)
    presets                     List compression presets
    settings [show]             Show the active preset selection
    settings set <PRESET>       Select the preset used for new images
    stats                       Record counts and sizes per tier

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    PICVAULT_CONFIG     Path to config file (overrides default location)
    PICVAULT_LOG        Log filter; overrides the [logging] level in the config

Config file location: $XDG_CONFIG_HOME/picvault/config.toml"#,
        min = MIN_CONCURRENCY,
        max = MAX_CONCURRENCY
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let config = match args.config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("warning: logging disabled: {:#}", e);
    }

    let db = Database::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    db.initialize()?;

    let recycle = RecycleBin::with_config(db.clone(), &config.trash);
    if config.trash.sweep_on_start {
        if let Err(e) = recycle.cleanup_expired() {
            tracing::warn!("Recycle bin sweep failed: {}", e);
        }
    }

    let settings = SettingsStore::new(db.clone());
    let mut pipeline = Pipeline::open(&db, recycle.clone())?;
    if settings.saved().is_none() {
        pipeline = pipeline.with_default_preset(find_preset(&config.compression.default_preset)?);
    }

    match args.command {
        Command::Ingest {
            file,
            id,
            chat,
            message,
            preset,
        } => {
            let bytes =
                std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let id = id.unwrap_or_else(|| content_id(&bytes));
            let message = message.unwrap_or_else(|| id.clone());
            let mut opts = IngestOptions::uploaded();
            if let Some(name) = preset {
                opts = opts.with_preset(find_preset(&name)?);
            }
            let result = pipeline.ingest(&id, &chat, &message, bytes, opts);
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.storage_unavailable {
                bail!("storage not available");
            }
        }
        Command::Show { id, original, out } => {
            let record = if original {
                pipeline.get_original_for_modal(&id)
            } else {
                pipeline.get_for_display(&id)
            };
            let Some(record) = record else {
                bail!("no {} image {}", if original { "original" } else { "web-use" }, id);
            };
            println!("id:         {}", record.id);
            println!("chat:       {} / message {}", record.chat_id, record.message_id);
            println!("type:       {} {}x{}", record.mime_type, record.width, record.height);
            println!("size:       {} bytes", record.size_bytes);
            println!("created:    {}", record.created_at.to_rfc3339());
            println!("accessed:   {}", record.last_accessed.to_rfc3339());
            println!("metadata:   {}", serde_json::to_string(&record.metadata)?);
            if let Some(path) = out {
                std::fs::write(&path, &record.bytes)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("written to  {}", path.display());
            }
        }
        Command::Delete { id } => {
            let moved = pipeline.delete_image(&id)?;
            if moved == 0 {
                bail!("no image {}", id);
            }
            println!("Moved {} record(s) to the recycle bin", moved);
        }
        Command::Restore { id } => match pipeline.restore_image(&id)? {
            Some(outcome) if outcome.is_written() => println!("Restored {}", id),
            Some(_) => println!("{} kept in recycle bin: a smaller copy is already stored", id),
            None => bail!("{} is not in the recycle bin", id),
        },
        Command::Batch {
            preset,
            concurrency,
            ids,
        } => {
            let ids = if ids.is_empty() {
                pipeline
                    .store_for(Tier::Original)
                    .try_list_all()?
                    .into_iter()
                    .map(|r| r.id)
                    .collect()
            } else {
                ids
            };
            let concurrency = concurrency.unwrap_or_else(|| config.batch.effective_concurrency());
            let runner = BatchRunner::new(Arc::new(pipeline));
            let job = runner
                .run(ids, &preset, concurrency, |progress, item| {
                    let status = match &item.error {
                        None => "ok".to_string(),
                        Some(e) => format!("failed: {}", e),
                    };
                    println!(
                        "[{}/{} {:>3}%] {} {}",
                        progress.completed,
                        progress.total,
                        progress.percent(),
                        item.id,
                        status
                    );
                })
                .await?;
            println!(
                "{} succeeded, {} failed, {} bytes saved",
                job.successful, job.failed, job.total_space_saved
            );
        }
        Command::Reorganize => {
            let result = Reorganizer::for_pipeline(&pipeline).reorganize();
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::TrashList => {
            let entries = recycle.list_all();
            if entries.is_empty() {
                println!("Recycle bin is empty");
            }
            for entry in entries {
                println!(
                    "{}  {:<8} {:<12} {:>10} bytes  {}",
                    entry.deleted_at.format("%Y-%m-%d %H:%M"),
                    entry.tier,
                    entry.deletion_reason.as_str(),
                    entry.record.size_bytes,
                    entry.id()
                );
            }
        }
        Command::TrashPurge { id } => {
            if !recycle.delete(&id) {
                bail!("{} is not in the recycle bin", id);
            }
            println!("Purged {}", id);
        }
        Command::TrashClear => {
            let purged = recycle.clear_all()?;
            println!("Purged {} image(s)", purged);
        }
        Command::TrashSweep { days } => {
            let days = days.unwrap_or(recycle.max_age_days());
            let purged = recycle.cleanup_older_than(days)?;
            println!("Purged {} image(s) older than {} days", purged, days);
        }
        Command::Presets => {
            let active = settings.load().preset;
            for preset in presets() {
                let marker = if preset.name == active { "*" } else { " " };
                println!(
                    "{} {:<14} {:>4}x{:<4} q{:.2} {:<4} {:<8} {}",
                    marker,
                    preset.name,
                    preset.max_width,
                    preset.max_height,
                    preset.quality,
                    preset.format.as_str(),
                    preset.backend.as_str(),
                    preset.description
                );
            }
        }
        Command::SettingsShow => {
            let selection = settings.load();
            println!("{}", toml::to_string_pretty(&selection)?);
        }
        Command::SettingsSet { preset } => {
            let selection = PresetSelection::named(preset);
            let resolved = selection.resolve()?;
            settings.save(&selection)?;
            println!("Active preset is now {}", resolved.name);
        }
        Command::Stats => {
            for tier in [Tier::Original, Tier::WebUse] {
                let store = pipeline.store_for(tier);
                println!(
                    "{:<9} {:>6} images {:>12} bytes",
                    tier,
                    store.count()?,
                    store.total_size()?
                );
            }
            println!(
                "{:<9} {:>6} images {:>12} bytes",
                "recycled",
                recycle.list_all().len(),
                recycle.total_size()?
            );
        }
    }

    Ok(())
}
