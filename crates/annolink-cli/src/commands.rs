//! Subcommand execution, generic over the store so it runs against the
//! in-memory store in tests.

use clap::Subcommand;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::info;

use annolink_core::{AnnotationId, AnnotationStore};
use annolink_engine::LinkingEngine;

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Check whether a set of annotations can be linked
    Validate {
        /// Candidate target ids (bare ids or full URLs)
        #[arg(required = true, num_args = 1..)]
        ids: Vec<String>,

        /// Linking annotation being edited, ignored during analysis
        #[arg(short, long)]
        exclude: Option<String>,
    },

    /// Remove deleted primary annotations from every linking annotation
    Cascade {
        /// Deleted primary annotation ids
        #[arg(required = true, num_args = 1..)]
        ids: Vec<String>,
    },

    /// Strip targets that no longer exist
    Orphans {
        /// Audit one linking annotation instead of the whole container
        #[arg(short, long)]
        id: Option<String>,
    },

    /// Consolidate duplicate linking annotations
    Dedupe,
}

/// What a command printed and how many items failed.
#[derive(Debug)]
pub struct CommandReport {
    pub output: JsonValue,
    pub failures: usize,
}

impl CommandReport {
    fn new<T: Serialize>(value: &T, failures: usize) -> anyhow::Result<Self> {
        Ok(Self {
            output: serde_json::to_value(value)?,
            failures,
        })
    }
}

fn canonical<S: AnnotationStore + 'static>(
    engine: &LinkingEngine<S>,
    raw: &[String],
) -> anyhow::Result<Vec<AnnotationId>> {
    let ids = engine.canonical_ids(raw);
    if ids.is_empty() {
        anyhow::bail!("no usable annotation ids given");
    }
    Ok(ids)
}

pub async fn execute<S: AnnotationStore + 'static>(
    engine: &LinkingEngine<S>,
    command: Commands,
) -> anyhow::Result<CommandReport> {
    match command {
        Commands::Validate { ids, exclude } => {
            let candidates = canonical(engine, &ids)?;
            let exclude = exclude.map(AnnotationId::new);
            let report = engine
                .validate_linking(&candidates, exclude.as_ref())
                .await?;
            CommandReport::new(&report, 0)
        }
        Commands::Cascade { ids } => {
            let deleted = canonical(engine, &ids)?;
            let result = engine.cascade_delete_from_linking(&deleted).await?;
            info!(
                run_id = %engine.run_id(),
                affected = result.affected.len(),
                "Cascade finished"
            );
            CommandReport::new(&result, result.errors().len())
        }
        Commands::Orphans { id: Some(id) } => {
            let id = canonical(engine, &[id])?.remove(0);
            let outcome = engine.audit_and_repair_orphans_by_id(&id).await?;
            CommandReport::new(&outcome, 0)
        }
        Commands::Orphans { id: None } => {
            let result = engine.audit_all_orphans().await?;
            CommandReport::new(&result, result.failed.len())
        }
        Commands::Dedupe => {
            let result = engine.consolidate_all().await?;
            CommandReport::new(&result, result.failed.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use annolink_core::LinkingAnnotation;
    use annolink_engine::EngineConfig;
    use annolink_store::mock::{InMemoryStore, MockOp};
    use std::time::Duration;

    fn engine() -> (InMemoryStore, LinkingEngine<InMemoryStore>) {
        let store = InMemoryStore::new("https://store.example/w3c", "maps");
        let config = EngineConfig::default().with_batch_delay(Duration::ZERO);
        (store.clone(), LinkingEngine::new(store, config))
    }

    fn seed(store: &InMemoryStore, slug: &str, targets: &[&str]) -> AnnotationId {
        let ids = targets
            .iter()
            .map(|t| store.canonicalizer().canonicalize(t).unwrap())
            .collect();
        let annotation = LinkingAnnotation::new(ids, vec![])
            .with_id(store.canonicalizer().canonicalize(slug).unwrap());
        store.insert_document(annotation.to_document().unwrap())
    }

    #[tokio::test]
    async fn test_validate_prints_report() {
        let (store, engine) = engine();
        seed(&store, "L1", &["A", "B"]);

        let report = execute(
            &engine,
            Commands::Validate {
                ids: vec!["A".into(), "C".into()],
                exclude: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(report.output["is_valid"], false);
        assert_eq!(report.failures, 0);
    }

    #[tokio::test]
    async fn test_cascade_counts_failures() {
        let (store, engine) = engine();
        let l1 = seed(&store, "L1", &["A", "B", "C"]);
        store.fail_always_for(
            MockOp::Update,
            &l1,
            annolink_core::Error::Timeout("slow".into()),
        );

        let report = execute(&engine, Commands::Cascade { ids: vec!["A".into()] })
            .await
            .unwrap();

        assert_eq!(report.failures, 1);
    }

    #[tokio::test]
    async fn test_blank_ids_rejected() {
        let (_, engine) = engine();
        let err = execute(&engine, Commands::Cascade { ids: vec!["  ".into()] })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no usable"));
    }

    #[tokio::test]
    async fn test_single_orphan_audit() {
        let (store, engine) = engine();
        store.insert_primary("A");
        store.insert_primary("B");
        seed(&store, "L1", &["A", "B"]);

        let report = execute(&engine, Commands::Orphans { id: Some("L1".into()) })
            .await
            .unwrap();

        assert_eq!(report.output["outcome"], "intact");
    }
}
