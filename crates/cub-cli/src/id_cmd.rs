use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use serde_json::json;

use cub_core::ids::AnyId;
use cub_core::tasks::{next_epic_id, next_plan_id, next_task_id};

use crate::{load_context, IdCommand, Output};

fn kind(id: &AnyId) -> &'static str {
    match id {
        AnyId::Spec(_) => "spec",
        AnyId::Plan(_) => "plan",
        AnyId::Epic(_) => "epic",
        AnyId::Task(_) => "task",
        AnyId::Standalone(_) => "standalone",
    }
}

fn parse(raw: &str, out: &Output) -> Result<ExitCode> {
    let Some(id) = AnyId::parse(raw) else {
        eprintln!("Not a cub id: {raw}");
        return Ok(ExitCode::FAILURE);
    };
    let spec = id.spec().map(ToString::to_string);
    out.emit(
        &json!({ "kind": kind(&id), "id": id.to_string(), "spec": spec }),
        || match &spec {
            Some(spec) if spec != &id.to_string() => format!("{} {id} (spec {spec})", kind(&id)),
            _ => format!("{} {id}", kind(&id)),
        },
    )?;
    Ok(ExitCode::SUCCESS)
}

/// `id parse` works anywhere; the other commands need a project.
pub(crate) fn run(root: Option<PathBuf>, command: IdCommand, out: &Output) -> Result<ExitCode> {
    let id = match command {
        IdCommand::Parse { id } => return parse(&id, out),
        IdCommand::NextSpec => load_context(root)?
            .allocate_spec_id()
            .context("Failed to allocate spec id")?
            .to_string(),
        IdCommand::NextStandalone => load_context(root)?
            .allocate_standalone_id()
            .context("Failed to allocate standalone task id")?
            .to_string(),
        IdCommand::NextPlan { spec } => {
            next_plan_id(&spec, &load_context(root)?.task_backend())?.to_string()
        }
        IdCommand::NextEpic { plan } => {
            next_epic_id(&plan, &load_context(root)?.task_backend())?.to_string()
        }
        IdCommand::NextTask { epic } => {
            next_task_id(&epic, &load_context(root)?.task_backend())?.to_string()
        }
    };
    out.emit(&json!({ "id": id }), || id.clone())?;
    Ok(ExitCode::SUCCESS)
}
