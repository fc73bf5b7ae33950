use std::collections::HashSet;

use crate::TranscriptSummary;

/// Collapses transcripts of the same logical conversation.
///
/// The agent re-saves a resumed conversation under a new session id, so an
/// older file holding a prefix of the messages is superseded by the newer
/// one. Candidates are visited largest id-set first and kept only when their
/// ids are not already covered by a kept candidate; equal sets keep the one
/// touched most recently. A transcript without message ids is covered by any
/// kept candidate, so it survives only when nothing else does. The result is
/// ordered newest start time first.
pub fn group_conversations(mut candidates: Vec<TranscriptSummary>) -> Vec<TranscriptSummary> {
    candidates.sort_by(|a, b| {
        b.message_ids
            .len()
            .cmp(&a.message_ids.len())
            .then_with(|| b.last_time.cmp(&a.last_time))
            .then_with(|| a.session_id.cmp(&b.session_id))
    });

    let mut kept: Vec<TranscriptSummary> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let covered = kept
            .iter()
            .any(|existing| is_subset(&candidate.message_ids, &existing.message_ids));
        if covered {
            tracing::debug!(session_id = %candidate.session_id, "dropping superseded transcript");
            continue;
        }
        kept.push(candidate);
    }

    kept.sort_by(|a, b| {
        b.start_time
            .cmp(&a.start_time)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
    kept
}

fn is_subset(candidate: &HashSet<String>, existing: &HashSet<String>) -> bool {
    candidate.len() <= existing.len() && candidate.is_subset(existing)
}
