use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;
use weft::doctor;
use weft::utils::open_database;
use weft::{
    Config, Database, EntryId, FsLibrary, LinkError, LinkRequest, LinkService, LinkType,
    NoteLocation, PushRequest, RecoveryEngine, RecoveryOptions, RecoveryStep, SyncEngine,
    TypeSelection,
};

/// weft - keeps note frontmatter links, the link index and the link cache consistent
#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Link graph consistency and recovery for a markdown note library")]
#[command(version)]
struct Cli {
    /// Library root (overrides WEFT_LIBRARY)
    #[arg(long, global = true, value_name = "DIR")]
    library: Option<PathBuf>,

    /// Cache database file (overrides WEFT_DATABASE)
    #[arg(long, global = true, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = Format::Json)]
    format: Format,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Json,
    Text,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Report every structural defect without changing anything
    #[command(name = "validate")]
    Validate(RecoveryArgs),
    /// Merge duplicated frontmatter blocks
    #[command(name = "fix_frontmatter")]
    FixFrontmatter(RecoveryArgs),
    /// Rename legacy and malformed ids to canonical ids
    #[command(name = "normalize_ids")]
    NormalizeIds(RecoveryArgs),
    /// Recompute missing or stale content hashes
    #[command(name = "rebuild_hashes")]
    RebuildHashes(RecoveryArgs),
    /// Rebuild the link cache from frontmatter and the link index
    #[command(name = "rebuild_database")]
    RebuildDatabase(RecoveryArgs),
    /// Run every recovery step in order
    #[command(name = "full_recovery")]
    FullRecovery(RecoveryArgs),
    /// Push frontmatter links to the cache and the link index
    Push(PushCommand),
    /// Pull cache changes back into frontmatter and the link index
    Pull,
    /// Link two notes
    Link(LinkCommand),
    /// Remove a link between two notes
    Unlink(UnlinkCommand),
    /// Show cached links around a note
    Links(LinksCommand),
}

#[derive(Parser)]
struct RecoveryArgs {
    /// Report intended changes without writing
    #[arg(long)]
    dry_run: bool,

    /// Tenant prefix for canonical ids (overrides WEFT_TENANT)
    #[arg(long, value_name = "TENANT")]
    tenant: Option<String>,
}

#[derive(Parser)]
struct PushCommand {
    /// Push a single note, by its path relative to the library root
    #[arg(long, value_name = "PATH")]
    note: Option<String>,

    /// Link types to push
    #[arg(long, value_enum, default_value_t = TypesArg::All)]
    types: TypesArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TypesArg {
    All,
    Critical,
    Routine,
}

impl From<TypesArg> for TypeSelection {
    fn from(arg: TypesArg) -> Self {
        match arg {
            TypesArg::All => TypeSelection::All,
            TypesArg::Critical => TypeSelection::Critical,
            TypesArg::Routine => TypeSelection::Routine,
        }
    }
}

#[derive(Parser)]
struct LinkCommand {
    #[arg(value_name = "SOURCE")]
    source: String,

    #[arg(value_name = "TARGET")]
    target: String,

    /// One of related, contradicts, supports, references, implements, blocks, depends_on
    #[arg(value_name = "TYPE")]
    link_type: LinkType,

    #[arg(short, long)]
    description: Option<String>,

    /// Provenance recorded in the cache
    #[arg(long, default_value = "cli")]
    created_by: String,
}

#[derive(Parser)]
struct UnlinkCommand {
    #[arg(value_name = "SOURCE")]
    source: String,

    #[arg(value_name = "TARGET")]
    target: String,

    #[arg(value_name = "TYPE")]
    link_type: LinkType,
}

#[derive(Parser)]
struct LinksCommand {
    #[arg(value_name = "ENTRY_ID")]
    entry_id: String,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "weft=debug" } else { "weft=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// 1 for errors caused by the request itself, 2 for anything that aborted
/// the run.
fn exit_code_for(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<LinkError>() {
        Some(
            LinkError::SelfLink(_)
            | LinkError::DuplicateLink(_)
            | LinkError::NotFound(_)
            | LinkError::UnknownLinkType(_),
        ) => 1,
        _ => 2,
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(library) = &cli.library {
        config = config.with_library_root(library);
    }
    if let Some(database) = &cli.database {
        config = config.with_database_path(database);
    }
    if !config.library_root.is_dir() {
        anyhow::bail!("Library root is not a directory: {}", config.library_root.display());
    }
    Ok(config)
}

/// Runs the command and returns the process exit code.
fn run(cli: &Cli) -> Result<i32> {
    let config = load_config(cli)?;
    let library = FsLibrary::new(&config.library_root);
    let db = open_database(&config.database_path)?;
    execute(&cli.command, cli.format, &config, &library, &db)
}

/// Executes a command against an already opened library and cache.
///
/// Separated from `run` to allow testing with in-memory databases.
fn execute(
    command: &Commands,
    format: Format,
    config: &Config,
    library: &FsLibrary,
    db: &Database,
) -> Result<i32> {
    let now = OffsetDateTime::now_utc();
    match command {
        Commands::Validate(args) => recovery_step(RecoveryStep::Validate, args, format, config, library, db, now),
        Commands::FixFrontmatter(args) => {
            recovery_step(RecoveryStep::FixFrontmatter, args, format, config, library, db, now)
        }
        Commands::NormalizeIds(args) => {
            recovery_step(RecoveryStep::NormalizeIds, args, format, config, library, db, now)
        }
        Commands::RebuildHashes(args) => {
            recovery_step(RecoveryStep::RebuildHashes, args, format, config, library, db, now)
        }
        Commands::RebuildDatabase(args) => {
            recovery_step(RecoveryStep::RebuildCache, args, format, config, library, db, now)
        }
        Commands::FullRecovery(args) => {
            let engine = RecoveryEngine::new(library, library, db).with_policy(config.retry.clone());
            let report = engine.full_recovery(&recovery_options(args, config), now)?;
            emit(format, &report, doctor::render_recovery)?;
            Ok(i32::from(report.has_failures()))
        }
        Commands::Push(cmd) => {
            let mut request = match &cmd.note {
                Some(path) => PushRequest::note(NoteLocation::new(path.as_str())),
                None => PushRequest::full_scan(),
            };
            request = request.types(cmd.types.into());
            let report = sync_engine(config, library, db).push_to_cache(&request, now)?;
            emit(format, &report, |r| doctor::render_sync("push", r))?;
            Ok(i32::from(report.has_failures()))
        }
        Commands::Pull => {
            let report = sync_engine(config, library, db).pull_from_cache(now)?;
            emit(format, &report, |r| doctor::render_sync("pull", r))?;
            Ok(i32::from(report.has_failures()))
        }
        Commands::Link(cmd) => {
            let mut request = LinkRequest::new(cmd.source.as_str(), cmd.target.as_str(), cmd.link_type)
                .created_by(cmd.created_by.as_str());
            if let Some(description) = &cmd.description {
                request = request.description(description.as_str());
            }
            let outcome = link_service(config, library, db).link_notes(&request, now)?;
            emit(format, &outcome, |o| doctor::render_link_outcome("Linked", o))?;
            Ok(i32::from(!outcome.failures.is_empty()))
        }
        Commands::Unlink(cmd) => {
            let outcome = link_service(config, library, db).unlink_notes(
                &EntryId::new(cmd.source.as_str()),
                &EntryId::new(cmd.target.as_str()),
                cmd.link_type,
                now,
            )?;
            emit(format, &outcome, |o| doctor::render_link_outcome("Unlinked", o))?;
            Ok(i32::from(!outcome.failures.is_empty()))
        }
        Commands::Links(cmd) => {
            let links = link_service(config, library, db).note_links(&EntryId::new(cmd.entry_id.as_str()))?;
            emit(format, &links, |l| doctor::render_note_links(&cmd.entry_id, l))?;
            Ok(0)
        }
    }
}

fn recovery_options(args: &RecoveryArgs, config: &Config) -> RecoveryOptions {
    RecoveryOptions {
        dry_run: args.dry_run,
        tenant: args.tenant.clone().or_else(|| config.tenant.clone()),
    }
}

fn recovery_step(
    step: RecoveryStep,
    args: &RecoveryArgs,
    format: Format,
    config: &Config,
    library: &FsLibrary,
    db: &Database,
    now: OffsetDateTime,
) -> Result<i32> {
    let engine = RecoveryEngine::new(library, library, db).with_policy(config.retry.clone());
    let report = engine.run_step(step, &recovery_options(args, config), now)?;
    emit(format, &report, doctor::render_step)?;
    Ok(i32::from(report.has_failures()))
}

fn sync_engine<'a>(config: &Config, library: &'a FsLibrary, db: &'a Database) -> SyncEngine<'a> {
    SyncEngine::new(library, library, db)
        .with_policy(config.retry.clone())
        .with_freshness_window(config.freshness_window)
}

fn link_service<'a>(config: &Config, library: &'a FsLibrary, db: &'a Database) -> LinkService<'a> {
    LinkService::new(library, library, db).with_policy(config.retry.clone())
}

/// Writes `value` as pretty JSON, or through the text renderer.
fn emit<T: Serialize>(format: Format, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
    match format {
        Format::Json => {
            let json = serde_json::to_string_pretty(value).context("Failed to serialize report")?;
            println!("{json}");
        }
        Format::Text => print!("{}", text(value)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn config(root: &Path) -> Config {
        Config::from_lookup(|key| match key {
            "WEFT_DATABASE" => Some(root.join("links.db").display().to_string()),
            _ => None,
        })
        .unwrap()
        .with_library_root(root)
    }

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn args(dry_run: bool) -> RecoveryArgs {
        RecoveryArgs {
            dry_run,
            tenant: None,
        }
    }

    #[test]
    fn parses_underscored_recovery_commands() {
        let cli = Cli::try_parse_from(["weft", "normalize_ids", "--dry-run", "--tenant", "acme"]).unwrap();
        match cli.command {
            Commands::NormalizeIds(args) => {
                assert!(args.dry_run);
                assert_eq!(args.tenant.as_deref(), Some("acme"));
            }
            _ => panic!("expected normalize_ids"),
        }
        assert_eq!(cli.format, Format::Json);
    }

    #[test]
    fn parses_link_type_arguments() {
        let cli = Cli::try_parse_from([
            "weft", "--format", "text", "link", "a", "b", "depends_on", "-d", "needs it",
        ])
        .unwrap();
        assert_eq!(cli.format, Format::Text);
        match cli.command {
            Commands::Link(cmd) => {
                assert_eq!(cmd.link_type, LinkType::DependsOn);
                assert_eq!(cmd.description.as_deref(), Some("needs it"));
                assert_eq!(cmd.created_by, "cli");
            }
            _ => panic!("expected link"),
        }
    }

    #[test]
    fn rejects_unknown_link_types() {
        assert!(Cli::try_parse_from(["weft", "link", "a", "b", "friends"]).is_err());
    }

    #[test]
    fn parses_push_selection() {
        let cli = Cli::try_parse_from(["weft", "push", "--note", "concept/a.md", "--types", "critical"]).unwrap();
        match cli.command {
            Commands::Push(cmd) => {
                assert_eq!(cmd.note.as_deref(), Some("concept/a.md"));
                assert_eq!(TypeSelection::from(cmd.types), TypeSelection::Critical);
            }
            _ => panic!("expected push"),
        }
    }

    #[test]
    fn request_errors_exit_with_one() {
        let err = anyhow::Error::new(LinkError::SelfLink(EntryId::new("a")));
        assert_eq!(exit_code_for(&err), 1);
        let err = anyhow::Error::new(LinkError::CacheRebuildFailure("disk full".to_string()));
        assert_eq!(exit_code_for(&err), 2);
        assert_eq!(exit_code_for(&anyhow::anyhow!("no library")), 2);
    }

    #[test]
    fn validate_with_defects_still_succeeds() {
        let dir = tempdir().unwrap();
        write(dir.path(), "concept/a.md", "---\nid: kb-1a2b3c4d\n---\n\nbody\n");
        let config = config(dir.path());
        let library = FsLibrary::new(dir.path());
        let db = Database::in_memory().unwrap();

        let code = execute(&Commands::Validate(args(false)), Format::Json, &config, &library, &db).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn unparseable_note_makes_fix_frontmatter_exit_with_one() {
        let dir = tempdir().unwrap();
        write(dir.path(), "concept/a.md", "---\n- not a mapping\n---\n\nbody\n");
        let config = config(dir.path());
        let library = FsLibrary::new(dir.path());
        let db = Database::in_memory().unwrap();

        let code = execute(&Commands::FixFrontmatter(args(false)), Format::Text, &config, &library, &db).unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn link_then_links_round_trip_through_the_cli() {
        let dir = tempdir().unwrap();
        write(dir.path(), "concept/a.md", "---\nid: library.concept.a\n---\n\nbody a\n");
        write(dir.path(), "concept/b.md", "---\nid: library.concept.b\n---\n\nbody b\n");
        let config = config(dir.path());
        let library = FsLibrary::new(dir.path());
        let db = Database::in_memory().unwrap();

        let link = Commands::Link(LinkCommand {
            source: "library.concept.a".to_string(),
            target: "library.concept.b".to_string(),
            link_type: LinkType::Related,
            description: None,
            created_by: "cli".to_string(),
        });
        assert_eq!(execute(&link, Format::Json, &config, &library, &db).unwrap(), 0);

        let self_link = Commands::Link(LinkCommand {
            source: "library.concept.a".to_string(),
            target: "library.concept.a".to_string(),
            link_type: LinkType::Related,
            description: None,
            created_by: "cli".to_string(),
        });
        let err = execute(&self_link, Format::Json, &config, &library, &db).unwrap_err();
        assert_eq!(exit_code_for(&err), 1);

        let links = Commands::Links(LinksCommand {
            entry_id: "library.concept.b".to_string(),
        });
        assert_eq!(execute(&links, Format::Text, &config, &library, &db).unwrap(), 0);
    }
}
