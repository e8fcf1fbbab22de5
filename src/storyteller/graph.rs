//! The per-chapter DAG, modeled as data.
//!
//! Nodes are a tagged union dispatched over a static edge list; no
//! trait objects, no dynamic graph structure. The full chapter graph
//! runs all nine nodes; the draft graph stops after refine and never
//! touches persistent world-state.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::llm::{LlmClient, LlmError};
use crate::retrieval::{MemoryRetriever, RetrievalError};
use crate::storage::{Store, StoreError};

use super::nodes;
use super::state::StorytellerState;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("prompt render failed: {0}")]
    Prompt(String),

    #[error("state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("graph context missing dependency: {0}")]
    MissingDependency(&'static str),
}

impl From<tera::Error> for GraphError {
    fn from(err: tera::Error) -> Self {
        GraphError::Prompt(err.to_string())
    }
}

/// Identity under which a chapter's narration row is persisted by
/// `state_update`, keeping the whole chapter commit in one session.
#[derive(Debug, Clone)]
pub struct NarrationMeta {
    pub prompt_version: String,
    pub model: String,
    pub input_hash: String,
}

/// Everything the nodes can reach. Absent LLM clients select the
/// deterministic fallback branches; an absent store forbids the
/// mutating nodes (draft mode).
#[derive(Clone)]
pub struct GraphContext {
    pub book_id: i64,
    pub config: Arc<AppConfig>,
    pub store: Option<Arc<Store>>,
    pub entity_llm: Option<Arc<LlmClient>>,
    pub narration_llm: Option<Arc<LlmClient>>,
    pub refine_llm: Option<Arc<LlmClient>>,
    pub memory: Option<Arc<dyn MemoryRetriever>>,
    pub narration_meta: Option<NarrationMeta>,
}

impl GraphContext {
    pub fn draft(config: Arc<AppConfig>, book_id: i64) -> Self {
        Self {
            book_id,
            config,
            store: None,
            entity_llm: None,
            narration_llm: None,
            refine_llm: None,
            memory: None,
            narration_meta: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    EntityExtract,
    StateLookup,
    MemoryRetrieve,
    StorytellerGenerate,
    ConsistencyCheck,
    EvidenceVerify,
    RefineNarration,
    StateUpdate,
    MemoryCommit,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::EntityExtract => "entity_extract",
            NodeKind::StateLookup => "state_lookup",
            NodeKind::MemoryRetrieve => "memory_retrieve",
            NodeKind::StorytellerGenerate => "storyteller_generate",
            NodeKind::ConsistencyCheck => "consistency_check",
            NodeKind::EvidenceVerify => "evidence_verify",
            NodeKind::RefineNarration => "refine_narration",
            NodeKind::StateUpdate => "state_update",
            NodeKind::MemoryCommit => "memory_commit",
        }
    }
}

/// START → … → END for a full chapter.
pub const CHAPTER_EDGES: &[NodeKind] = &[
    NodeKind::EntityExtract,
    NodeKind::StateLookup,
    NodeKind::MemoryRetrieve,
    NodeKind::StorytellerGenerate,
    NodeKind::ConsistencyCheck,
    NodeKind::EvidenceVerify,
    NodeKind::RefineNarration,
    NodeKind::StateUpdate,
    NodeKind::MemoryCommit,
];

/// Draft variant: no lookups against, and no writes into, the
/// world-state tables. Callers supply any baseline fields themselves.
pub const DRAFT_EDGES: &[NodeKind] = &[
    NodeKind::EntityExtract,
    NodeKind::MemoryRetrieve,
    NodeKind::StorytellerGenerate,
    NodeKind::ConsistencyCheck,
    NodeKind::EvidenceVerify,
    NodeKind::RefineNarration,
];

pub struct StorytellerGraph {
    edges: &'static [NodeKind],
}

impl StorytellerGraph {
    pub fn chapter() -> Self {
        Self {
            edges: CHAPTER_EDGES,
        }
    }

    pub fn draft() -> Self {
        Self { edges: DRAFT_EDGES }
    }

    pub fn edges(&self) -> &'static [NodeKind] {
        self.edges
    }

    /// Run the node sequence over the state. Any node error aborts
    /// the chapter; nothing is persisted unless `state_update`
    /// committed its session.
    pub async fn invoke(
        &self,
        state: &mut StorytellerState,
        ctx: &GraphContext,
    ) -> Result<(), GraphError> {
        for node in self.edges {
            run_node(*node, state, ctx).await.map_err(|err| {
                log::error!(
                    "Storyteller node failed node={} chapter_id={} chapter_idx={} error={err}",
                    node.as_str(),
                    state.chapter_id,
                    state.chapter_idx
                );
                err
            })?;
        }
        Ok(())
    }
}

async fn run_node(
    kind: NodeKind,
    state: &mut StorytellerState,
    ctx: &GraphContext,
) -> Result<(), GraphError> {
    match kind {
        NodeKind::EntityExtract => nodes::entity_extract::run(state, ctx).await,
        NodeKind::StateLookup => nodes::state_lookup::run(state, ctx),
        NodeKind::MemoryRetrieve => nodes::memory_retrieve::run(state, ctx).await,
        NodeKind::StorytellerGenerate => nodes::generate::run(state, ctx).await,
        NodeKind::ConsistencyCheck => {
            nodes::consistency::run(state);
            Ok(())
        }
        NodeKind::EvidenceVerify => {
            nodes::evidence::run(state, &ctx.config);
            Ok(())
        }
        NodeKind::RefineNarration => nodes::refine::run(state, ctx).await,
        NodeKind::StateUpdate => nodes::state_update::run(state, ctx),
        NodeKind::MemoryCommit => {
            nodes::memory_commit::run(state);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_edges_are_the_fixed_dag() {
        let names: Vec<&str> = CHAPTER_EDGES.iter().map(NodeKind::as_str).collect();
        assert_eq!(
            names,
            vec![
                "entity_extract",
                "state_lookup",
                "memory_retrieve",
                "storyteller_generate",
                "consistency_check",
                "evidence_verify",
                "refine_narration",
                "state_update",
                "memory_commit",
            ]
        );
    }

    #[test]
    fn draft_edges_skip_mutating_nodes() {
        assert!(!DRAFT_EDGES.contains(&NodeKind::StateLookup));
        assert!(!DRAFT_EDGES.contains(&NodeKind::StateUpdate));
        assert!(!DRAFT_EDGES.contains(&NodeKind::MemoryCommit));
    }

    #[tokio::test]
    async fn draft_graph_runs_without_a_store() {
        let mut state = StorytellerState {
            chapter_idx: 1,
            chapter_text: "韩立在山中修炼青元剑诀，进境缓慢。".to_string(),
            ..Default::default()
        };
        let ctx = GraphContext::draft(Arc::new(AppConfig::default()), 1);
        StorytellerGraph::draft()
            .invoke(&mut state, &ctx)
            .await
            .unwrap();
        assert!(!state.narration.is_empty());
        assert!(state.evidence_report.is_some());
        // Draft mode never reaches the committing nodes.
        assert!(state.mutations_applied.is_none());
        assert!(!state.memory_committed);
    }
}
