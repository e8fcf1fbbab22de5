//! Memory commit marker.
//!
//! Narration vectors are built after the fact by the retrieval-assets
//! builder, so this node only records that the chapter reached the
//! end of the DAG. The contract allows a future implementation to
//! embed the narration immediately.

use crate::storyteller::state::StorytellerState;

pub fn run(state: &mut StorytellerState) {
    state.memory_committed = true;
}
