//! Human and JSON printers for command results.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value as Json;
use yoke_apply::{Action, DriftReport, DriftState, FieldChange, Inspection, Plan, RevisionChange, RevisionDiff};
use yoke_core::{ReconcileReport, ResourceOutcome, ResourceSet};

use crate::Output;

fn json<T: Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn show(v: Option<&Json>) -> String {
    match v {
        None => "<absent>".to_string(),
        Some(Json::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn changes(list: &[FieldChange]) {
    for c in list {
        println!("    {}: {} -> {}", c.path, show(c.live.as_ref()), show(c.desired.as_ref()));
    }
}

fn timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0).map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_else(|| "-".to_string())
}

/// Rendered resources; YAML documents for humans.
pub(crate) fn resources(output: Output, set: &ResourceSet) -> Result<()> {
    let payloads: Vec<&Json> = set.iter().map(|d| &d.payload).collect();
    match output {
        Output::Json => json(&payloads),
        Output::Human => {
            for p in payloads {
                print!("---\n{}", serde_yaml::to_string(p)?);
            }
            Ok(())
        }
    }
}

pub(crate) fn plan(output: Output, plan: &Plan) -> Result<()> {
    if output == Output::Json {
        return json(plan);
    }
    for step in &plan.steps {
        match &step.action {
            Action::Create => println!("+ {}", step.id),
            Action::Update { changes: list } => {
                println!("~ {}", step.id);
                changes(list);
            }
            Action::Unchanged => println!("  {}", step.id),
            Action::Prune => println!("- {}", step.id),
        }
    }
    if plan.is_noop() {
        println!("no changes");
    }
    Ok(())
}

pub(crate) fn report(output: Output, report: &ReconcileReport) -> Result<()> {
    if output == Output::Json {
        return json(report);
    }
    println!("release {} revision {}", report.release, report.revision);
    for r in &report.results {
        if r.outcome != ResourceOutcome::Unchanged {
            println!("  {:<10} {}", r.outcome.to_string(), r.id);
        }
    }
    println!(
        "created {}, updated {}, unchanged {}, pruned {}, failed {}",
        report.created().len(),
        report.updated().len(),
        report.unchanged().len(),
        report.pruned().len(),
        report.failed().count()
    );
    Ok(())
}

pub(crate) fn inspection(output: Output, i: &Inspection) -> Result<()> {
    if output == Output::Json {
        return json(i);
    }
    println!("release {}", i.history.release);
    println!("  {:<5} {:<20} {:<10} SOURCE", "SEQ", "CREATED", "RESOURCES");
    for r in &i.history.revisions {
        let mark = if r.active { '*' } else { ' ' };
        println!("{mark} {:<5} {:<20} {:<10} {}", r.sequence, timestamp(r.created_at), r.resource_count, r.source.reference);
    }
    println!();
    println!("revision {}:", i.revision.sequence);
    for doc in &i.revision.resources {
        println!("  {}", doc.id);
    }
    Ok(())
}

pub(crate) fn revision_diff(output: Output, d: &RevisionDiff) -> Result<()> {
    if output == Output::Json {
        return json(d);
    }
    println!("release {}: revision {} -> {}", d.release, d.from, d.to);
    for e in &d.entries {
        match &e.change {
            RevisionChange::Added => println!("+ {}", e.id),
            RevisionChange::Removed => println!("- {}", e.id),
            RevisionChange::Changed { changes: list } => {
                println!("~ {}", e.id);
                changes(list);
            }
            RevisionChange::Same => {}
        }
    }
    Ok(())
}

pub(crate) fn drift(output: Output, r: &DriftReport) -> Result<()> {
    if output == Output::Json {
        return json(r);
    }
    if r.no_drift {
        println!("no drift from revision {} of {}", r.revision, r.release);
        return Ok(());
    }
    println!("release {} drifted from revision {}", r.release, r.revision);
    for e in r.drifted() {
        match &e.state {
            DriftState::Missing => println!("  missing   {}", e.id),
            DriftState::Modified { changes: list } => {
                println!("  modified  {}", e.id);
                changes(list);
            }
            DriftState::UnmanagedExtra => println!("  extra     {}", e.id),
            DriftState::Unchanged => {}
        }
    }
    Ok(())
}

pub(crate) fn version(output: Output, yoke: &str, wasmtime: &str) -> Result<()> {
    #[derive(Serialize)]
    struct Versions<'a> {
        yoke: &'a str,
        wasmtime: &'a str,
    }
    match output {
        Output::Json => json(&Versions { yoke, wasmtime }),
        Output::Human => {
            println!("yoke      {yoke}");
            println!("wasmtime  {wasmtime}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn values_render_compactly() {
        assert_eq!(show(None), "<absent>");
        assert_eq!(show(Some(&json!("x"))), "x");
        assert_eq!(show(Some(&json!({"a": 1}))), r#"{"a":1}"#);
    }

    #[test]
    fn timestamps_are_utc() {
        assert_eq!(timestamp(0), "1970-01-01 00:00:00");
    }
}
