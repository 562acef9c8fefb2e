// SPDX-License-Identifier: AGPL-3.0-only

//! Command-line front end for module administration (spec.md §6 "Module
//! admin"): install/remove/update a module's schema record, toggle a
//! feature, flip replay support, or set filesystem ownership/mode on a
//! module's persisted files, without writing a line of client code. Data
//! operations (get/set/subscribe/...) are a library surface, not a CLI
//! concern — this binary only ever touches [`treestore::module::ModuleStore`]
//! through [`treestore::Repository`]'s module-admin wrappers.

use std::env;
use std::fs;
use std::process::ExitCode;
use std::sync::Arc;

use env_logger::Builder;

use treestore::module::PermissiveSchemaProvider;
use treestore::tree::SchemaRef;
use treestore::{Config, Repository, SchemaResolver};

struct NoSchemaResolver;

impl SchemaResolver for NoSchemaResolver {
    fn resolve_root(&self, _module: &str, _name: &str) -> Option<SchemaRef> {
        None
    }
}

fn usage() -> &'static str {
    "treestore-admin <command> [args]\n\n\
     commands:\n  \
     install <module> --revision <n> --file <path> [--feature <name>]...\n  \
     update <module> --revision <n> --file <path>\n  \
     remove <module>\n  \
     enable-feature <module> <feature>\n  \
     disable-feature <module> <feature>\n  \
     set-replay <module> <on|off>\n  \
     set-access <module> [--owner <name>] [--group <name>] [--mode <octal>]\n  \
     apply-scheduled\n  \
     list\n"
}

fn main() -> ExitCode {
    Builder::new()
        .parse_filters(&env::var("TREESTORE_LOG").unwrap_or_else(|_| "info".to_owned()))
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("treestore-admin: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> treestore::StoreResult<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print!("{}", usage());
        return Ok(());
    };
    let rest = &args[1..];

    let config = Config::default().with_env_overrides();
    let repo = Repository::open(config, Arc::new(NoSchemaResolver))?;

    match command.as_str() {
        "install" => cmd_install(&repo, rest),
        "update" => cmd_update(&repo, rest),
        "remove" => cmd_remove(&repo, rest),
        "enable-feature" => cmd_feature(&repo, rest, true),
        "disable-feature" => cmd_feature(&repo, rest, false),
        "set-replay" => cmd_set_replay(&repo, rest),
        "set-access" => cmd_set_access(&repo, rest),
        "apply-scheduled" => {
            repo.apply_scheduled_modules(&PermissiveSchemaProvider)?;
            log::info!("scheduled module operations applied");
            Ok(())
        }
        "list" => {
            for entry in repo.list_installed_modules() {
                println!("{}\trev={}\treplay={}", entry.name, entry.revision, entry.replay_supported);
            }
            Ok(())
        }
        "help" | "-h" | "--help" => {
            print!("{}", usage());
            Ok(())
        }
        other => Err(treestore::Error::invalid_arg(format!("unknown command '{other}'"))),
    }
}

fn flag_value(args: &[String], name: &str) -> Option<String> {
    args.iter().position(|a| a == name).and_then(|i| args.get(i + 1)).cloned()
}

fn flag_values(args: &[String], name: &str) -> Vec<String> {
    args.iter()
        .zip(args.iter().skip(1))
        .filter(|(a, _)| a.as_str() == name)
        .map(|(_, v)| v.clone())
        .collect()
}

fn cmd_install(repo: &Repository, args: &[String]) -> treestore::StoreResult<()> {
    let module = args.first().ok_or_else(|| treestore::Error::invalid_arg("install: missing module name"))?;
    let revision: u32 = flag_value(args, "--revision")
        .ok_or_else(|| treestore::Error::invalid_arg("install: --revision is required"))?
        .parse()
        .map_err(|_| treestore::Error::invalid_arg("install: --revision must be a number"))?;
    let file = flag_value(args, "--file").ok_or_else(|| treestore::Error::invalid_arg("install: --file is required"))?;
    let yang_text = fs::read_to_string(&file)?;
    let features = flag_values(args, "--feature");
    repo.install_module(module, revision, yang_text, features)?;
    log::info!("installed module '{module}' (scheduled, revision {revision})");
    Ok(())
}

fn cmd_update(repo: &Repository, args: &[String]) -> treestore::StoreResult<()> {
    let module = args.first().ok_or_else(|| treestore::Error::invalid_arg("update: missing module name"))?;
    let revision: u32 = flag_value(args, "--revision")
        .ok_or_else(|| treestore::Error::invalid_arg("update: --revision is required"))?
        .parse()
        .map_err(|_| treestore::Error::invalid_arg("update: --revision must be a number"))?;
    let file = flag_value(args, "--file").ok_or_else(|| treestore::Error::invalid_arg("update: --file is required"))?;
    let yang_text = fs::read_to_string(&file)?;
    repo.update_module(module, revision, yang_text)?;
    log::info!("updated module '{module}' (scheduled, revision {revision})");
    Ok(())
}

fn cmd_remove(repo: &Repository, args: &[String]) -> treestore::StoreResult<()> {
    let module = args.first().ok_or_else(|| treestore::Error::invalid_arg("remove: missing module name"))?;
    repo.remove_module(module)?;
    log::info!("removed module '{module}' (scheduled)");
    Ok(())
}

fn cmd_feature(repo: &Repository, args: &[String], enable: bool) -> treestore::StoreResult<()> {
    let module = args.first().ok_or_else(|| treestore::Error::invalid_arg("missing module name"))?;
    let feature = args.get(1).ok_or_else(|| treestore::Error::invalid_arg("missing feature name"))?;
    if enable {
        repo.enable_feature(module, feature)?;
    } else {
        repo.disable_feature(module, feature)?;
    }
    log::info!("{} feature '{feature}' on module '{module}' (scheduled)", if enable { "enabled" } else { "disabled" });
    Ok(())
}

fn cmd_set_replay(repo: &Repository, args: &[String]) -> treestore::StoreResult<()> {
    let module = args.first().ok_or_else(|| treestore::Error::invalid_arg("set-replay: missing module name"))?;
    let on = match args.get(1).map(String::as_str) {
        Some("on") => true,
        Some("off") => false,
        _ => return Err(treestore::Error::invalid_arg("set-replay: expected 'on' or 'off'")),
    };
    repo.set_replay_support(module, on)?;
    log::info!("replay support for '{module}' set to {on}");
    Ok(())
}

fn cmd_set_access(repo: &Repository, args: &[String]) -> treestore::StoreResult<()> {
    let module = args.first().ok_or_else(|| treestore::Error::invalid_arg("set-access: missing module name"))?;
    let owner = flag_value(args, "--owner");
    let group = flag_value(args, "--group");
    let mode = flag_value(args, "--mode")
        .map(|m| u32::from_str_radix(&m, 8))
        .transpose()
        .map_err(|_| treestore::Error::invalid_arg("set-access: --mode must be octal, e.g. 640"))?;
    repo.set_module_access(module, owner, group, mode)?;
    log::info!("updated access for module '{module}'");
    Ok(())
}
