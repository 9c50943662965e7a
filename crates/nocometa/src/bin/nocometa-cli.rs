#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::mem;
use std::path::PathBuf;

use nocometa::{
    CacheBackendKind, CacheConfig, CacheGetType, CacheScope, ConditionRule, FilterOwner,
    FilterRepository, MetaCache, MetaContext, SqliteMetaStore, validate_condition,
};
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

enum Command {
    Export,
    Clear,
    Get { key: String, get_type: CacheGetType },
    DelAll { scope: CacheScope, pattern: String },
    DeepDel { scope: CacheScope, key: String, direction: String },
    Eval { rules: PathBuf, row: PathBuf },
    Tree { owner: FilterOwner },
}

fn main() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let mut config = CacheConfig::from_env()?;
    let mut backend: Option<String> = None;
    let mut cache_path: Option<PathBuf> = None;
    let mut meta_path: Option<PathBuf> = None;
    let mut workspace = String::new();
    let mut base: Option<String> = None;
    let mut positional = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--backend" => {
                backend = Some(args.next().ok_or("--backend requires memory or sqlite")?);
            }
            "--path" => {
                cache_path = Some(args.next().ok_or("--path requires a file")?.into());
            }
            "--namespace" => {
                config.namespace = args.next().ok_or("--namespace requires a value")?;
            }
            "--disable" => {
                config.disabled = true;
            }
            "--meta" => {
                meta_path = Some(args.next().ok_or("--meta requires a file")?.into());
            }
            "--workspace" => {
                workspace = args.next().ok_or("--workspace requires an id")?;
            }
            "--base" => {
                base = Some(args.next().ok_or("--base requires an id")?);
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other if other.starts_with("--") => {
                return Err(format!("unknown argument: {other}").into());
            }
            _ => positional.push(arg),
        }
    }

    let current = mem::take(&mut config.backend);
    config.backend = match (backend.as_deref(), cache_path) {
        (None, None) => current,
        (Some("memory"), _) => CacheBackendKind::InMemory,
        (Some("sqlite") | None, Some(path)) => CacheBackendKind::Sqlite { path },
        (Some("sqlite"), None) => match current {
            CacheBackendKind::Sqlite { path } => CacheBackendKind::Sqlite { path },
            CacheBackendKind::InMemory => return Err("--backend sqlite requires --path".into()),
        },
        (Some(other), _) => return Err(format!("unsupported backend: {other}").into()),
    };

    let Some(command) = parse_command(&positional)? else {
        print_help();
        return Ok(());
    };

    let cache = MetaCache::init(&config)?;
    info!(
        backend = cache.backend_name(),
        namespace = cache.namespace(),
        "metadata cache ready"
    );

    match command {
        Command::Export => {
            print_json(&Value::Object(cache.export().into_iter().collect()))?;
        }
        Command::Clear => {
            println!("flushed={}", cache.destroy());
        }
        Command::Get { key, get_type } => {
            print_json(&cache.get(&key, get_type))?;
        }
        Command::DelAll { scope, pattern } => {
            println!("deleted={}", cache.del_all(scope, &pattern));
        }
        Command::DeepDel {
            scope,
            key,
            direction,
        } => {
            println!("deleted={}", cache.deep_del_named(scope, &key, &direction));
        }
        Command::Eval { rules, row } => {
            let rules: Vec<ConditionRule> = serde_json::from_str(&fs::read_to_string(rules)?)?;
            let row: Map<String, Value> = serde_json::from_str(&fs::read_to_string(row)?)?;
            println!("{}", validate_condition(&rules, &row));
        }
        Command::Tree { owner } => {
            let meta_path = meta_path.ok_or("tree requires --meta <file>")?;
            let store = SqliteMetaStore::open(meta_path)?;
            let mut context = MetaContext::new(workspace);
            if let Some(base) = base {
                context = context.with_base(base);
            }
            let repo = FilterRepository::new(&cache, &store, context);
            print_json(&serde_json::to_value(repo.get_filter_object(&owner)?)?)?;
        }
    }

    cache.shutdown();
    Ok(())
}

fn parse_command(positional: &[String]) -> Result<Option<Command>, Box<dyn Error>> {
    let words = positional.iter().map(String::as_str).collect::<Vec<_>>();
    let command = match words.as_slice() {
        [] => return Ok(None),
        ["export"] => Command::Export,
        ["clear"] => Command::Clear,
        ["get", key] => Command::Get {
            key: (*key).to_owned(),
            get_type: CacheGetType::Object,
        },
        ["get", key, get_type] => Command::Get {
            key: (*key).to_owned(),
            get_type: get_type.parse()?,
        },
        ["del-all", scope, pattern] => Command::DelAll {
            scope: scope.parse()?,
            pattern: (*pattern).to_owned(),
        },
        ["deep-del", scope, key, direction] => Command::DeepDel {
            scope: scope.parse()?,
            key: (*key).to_owned(),
            direction: (*direction).to_owned(),
        },
        ["eval", rules, row] => Command::Eval {
            rules: PathBuf::from(*rules),
            row: PathBuf::from(*row),
        },
        ["tree", "view", id] => Command::Tree {
            owner: FilterOwner::View((*id).to_owned()),
        },
        ["tree", "hook", id] => Command::Tree {
            owner: FilterOwner::Hook((*id).to_owned()),
        },
        other => return Err(format!("unknown command: {}", other.join(" ")).into()),
    };
    Ok(Some(command))
}

fn print_json(value: &Value) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_help() {
    println!(
        "nocometa-cli\n\
         Usage:\n\
         \tnocometa-cli [options] <command>\n\
         Commands:\n\
         \texport                              Dump every entry of the namespace as JSON\n\
         \tclear                               Flush the namespace\n\
         \tget <key> [scalar|array|object]     Read one logical key\n\
         \tdel-all <scope> <pattern>           Delete keys of a scope matching a glob\n\
         \tdeep-del <scope> <key> <direction>  Cascade delete (CHILD_TO_PARENT or PARENT_TO_CHILD)\n\
         \teval <rules.json> <row.json>        Evaluate condition rules against a row\n\
         \ttree view|hook <id>                 Print the filter tree of an owner (needs --meta)\n\
         Options:\n\
         \t--backend <kind>     memory or sqlite (default from NC_CACHE_BACKEND)\n\
         \t--path <file>        SQLite cache file\n\
         \t--namespace <ns>     Key prefix (default nc)\n\
         \t--disable            Run with caching disabled\n\
         \t--meta <file>        SQLite metadata store\n\
         \t--workspace <id>     Workspace of the metadata context\n\
         \t--base <id>          Base of the metadata context\n\
         \t-h, --help           Show this help\n\
         Logging is controlled by RUST_LOG (default info) and written to stderr."
    );
}
