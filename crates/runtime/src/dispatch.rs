//! Tool-call batch dispatch: guard every call in request order, then run the
//! allowed ones in waves of independent read-only calls.

use std::path::{Path, PathBuf};

use coda_exec::{SessionPolicy, ToolExecutor, ToolGuard};
use coda_llm::ToolCall;
use coda_tools::{ToolEnvelope, ToolRegistry, codes, paths};
use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::{EventSink, PresentationEvent};

/// What a call touches, as far as scheduling is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footprint {
    pub read_only: bool,
    pub paths: Vec<PathBuf>,
}

impl Footprint {
    fn overlaps(&self, other: &Footprint) -> bool {
        self.paths
            .iter()
            .any(|a| other.paths.iter().any(|b| a.starts_with(b) || b.starts_with(a)))
    }
}

/// Work out a call's footprint from its spec. Path params fall back to their
/// declared default; a call that names no path at all touches the root.
pub fn footprint(registry: &ToolRegistry, root: &Path, call: &ToolCall) -> Footprint {
    let Some(spec) = registry.spec(&call.name) else {
        return Footprint {
            read_only: false,
            paths: vec![root.to_path_buf()],
        };
    };
    let mut touched = Vec::new();
    for param in spec.path_params() {
        let value = call
            .arguments
            .get(&param.name)
            .filter(|v| !v.is_null())
            .or(param.default.as_ref());
        match value {
            Some(Value::String(s)) => touched.push(paths::normalize_path(&root.join(s))),
            Some(Value::Array(items)) => touched.extend(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| paths::normalize_path(&root.join(s))),
            ),
            _ => {}
        }
    }
    if touched.is_empty() {
        touched.push(root.to_path_buf());
    }
    Footprint {
        read_only: spec.metadata.read_only,
        paths: touched,
    }
}

/// Group indices into waves that may run concurrently. Order is preserved:
/// waves are consecutive runs of the input, and a mutating call always
/// forms a wave of its own.
pub fn plan_waves(footprints: &[(usize, Footprint)]) -> Vec<Vec<usize>> {
    let mut waves: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<(usize, &Footprint)> = Vec::new();

    for (idx, fp) in footprints {
        let conflicts = !fp.read_only || current.iter().any(|(_, other)| other.overlaps(fp));
        if conflicts && !current.is_empty() {
            waves.push(current.drain(..).map(|(i, _)| i).collect());
        }
        if fp.read_only {
            current.push((*idx, fp));
        } else {
            waves.push(vec![*idx]);
        }
    }
    if !current.is_empty() {
        waves.push(current.into_iter().map(|(i, _)| i).collect());
    }
    waves
}

fn cancelled_envelope() -> ToolEnvelope {
    ToolEnvelope::failure(codes::CANCELLED, "cancelled before the call could run")
}

/// Emit `ToolCallFinished` for every resolved result from `cursor` on, stopping
/// at the first gap so events stay in request order.
async fn flush_finished(
    calls: &[ToolCall],
    results: &[Option<ToolEnvelope>],
    cursor: &mut usize,
    events: &EventSink,
) {
    while let Some(Some(env)) = results.get(*cursor) {
        let call = &calls[*cursor];
        events
            .emit(PresentationEvent::ToolCallFinished {
                call_id: call.id.clone(),
                name: call.name.clone(),
                ok: env.ok,
                error_code: env.error_code.clone(),
                message: env.message.clone(),
            })
            .await;
        *cursor += 1;
    }
}

/// Answer every call in `calls`. The returned vector always has one envelope
/// per call, in request order, even when the batch is cancelled midway.
pub async fn run_batch(
    calls: &[ToolCall],
    guard: &ToolGuard,
    executor: &ToolExecutor,
    session: &mut SessionPolicy,
    events: &EventSink,
    cancel: &CancellationToken,
) -> Vec<ToolEnvelope> {
    let mut results: Vec<Option<ToolEnvelope>> = vec![None; calls.len()];
    let mut allowed: Vec<(usize, Footprint)> = Vec::new();
    let mut cursor = 0;

    // Guard phase: sequential, since a check may wait on the human.
    for (idx, call) in calls.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        events
            .emit(PresentationEvent::ToolCallStarted {
                call_id: call.id.clone(),
                name: call.name.clone(),
                summary: call.summary(),
            })
            .await;
        let decision = guard.check(call, session, cancel).await;
        match decision.to_envelope() {
            Some(denied) => results[idx] = Some(denied),
            None => allowed.push((
                idx,
                footprint(guard.registry(), guard.workspace_root(), call),
            )),
        }
    }

    let waves = plan_waves(&allowed);
    debug!(calls = calls.len(), allowed = allowed.len(), waves = waves.len(), "dispatching tool batch");

    for wave in waves {
        flush_finished(calls, &results, &mut cursor, events).await;
        if cancel.is_cancelled() {
            break;
        }
        let outputs = join_all(wave.iter().map(|&i| executor.execute(&calls[i], cancel))).await;
        for (i, env) in wave.into_iter().zip(outputs) {
            results[i] = Some(env);
        }
    }

    let mut unanswered = 0;
    for slot in results.iter_mut().filter(|r| r.is_none()) {
        *slot = Some(cancelled_envelope());
        unanswered += 1;
    }
    if unanswered > 0 {
        info!(unanswered, "tool batch interrupted; synthesized CANCELLED results");
    }
    flush_finished(calls, &results, &mut cursor, events).await;

    results.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use coda_audit::AuditLog;
    use coda_config::SafetyConfig;
    use coda_exec::ExecutionPolicy;
    use serde_json::json;
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fp(read_only: bool, paths: &[&str]) -> Footprint {
        Footprint {
            read_only,
            paths: paths.iter().map(PathBuf::from).collect(),
        }
    }

    // ── Wave planning ────────────────────────────────────────────────────────

    #[test]
    fn independent_reads_share_a_wave() {
        let waves = plan_waves(&[
            (0, fp(true, &["/w/a.rs"])),
            (1, fp(true, &["/w/b.rs"])),
            (2, fp(true, &["/w/src"])),
        ]);
        assert_eq!(waves, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn overlapping_paths_split_waves() {
        let waves = plan_waves(&[
            (0, fp(true, &["/w/src"])),
            (1, fp(true, &["/w/src/lib.rs"])),
            (2, fp(true, &["/w/docs"])),
        ]);
        assert_eq!(waves, vec![vec![0], vec![1, 2]]);
    }

    #[test]
    fn mutating_calls_run_alone_in_order() {
        let waves = plan_waves(&[
            (0, fp(true, &["/w/a"])),
            (2, fp(false, &["/w/b"])),
            (3, fp(true, &["/w/c"])),
            (5, fp(true, &["/w/d"])),
            (6, fp(false, &["/w/e"])),
        ]);
        assert_eq!(waves, vec![vec![0], vec![2], vec![3, 5], vec![6]]);
    }

    #[test]
    fn footprint_uses_defaults_and_root() {
        let reg = ToolRegistry::with_builtins();
        let root = Path::new("/w");
        let list = footprint(&reg, root, &ToolCall::new("1", "file_list", json!({})));
        assert!(list.read_only);
        assert_eq!(list.paths, vec![PathBuf::from("/w")]);

        let mv = footprint(
            &reg,
            root,
            &ToolCall::new("2", "file_move", json!({"src": "a/../b", "dst": "c"})),
        );
        assert!(!mv.read_only);
        assert_eq!(mv.paths, vec![PathBuf::from("/w/b"), PathBuf::from("/w/c")]);

        let unknown = footprint(&reg, root, &ToolCall::new("3", "nope", json!({})));
        assert!(!unknown.read_only);
    }

    // ── Batches ──────────────────────────────────────────────────────────────

    struct Rig {
        _dir: TempDir,
        guard: ToolGuard,
        executor: ToolExecutor,
        audit: Arc<AuditLog>,
    }

    fn rig() -> anyhow::Result<Rig> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.txt"), "alpha\n")?;
        fs::write(dir.path().join("b.txt"), "beta\n")?;
        let root = dir.path().canonicalize()?;
        let registry = Arc::new(ToolRegistry::with_builtins());
        let audit = Arc::new(AuditLog::in_memory());
        let policy = ExecutionPolicy::from_config(&SafetyConfig::default())?;
        let guard = ToolGuard::new(Arc::clone(&registry), policy, &root, Arc::clone(&audit));
        let executor = ToolExecutor::new(registry, &root, Duration::from_secs(10));
        Ok(Rig {
            _dir: dir,
            guard,
            executor,
            audit,
        })
    }

    #[tokio::test]
    async fn every_call_gets_one_result_in_order() -> anyhow::Result<()> {
        let rig = rig()?;
        let calls = vec![
            ToolCall::new("c1", "file_read", json!({"path": "a.txt"})),
            ToolCall::new("c2", "file_read", json!({"path": "../escape.txt"})),
            ToolCall::new("c3", "file_read", json!({"path": "b.txt"})),
            ToolCall::new("c4", "no_such_tool", json!({})),
        ];
        let mut session = SessionPolicy::new(true);
        let (events, mut rx) = EventSink::channel(64);
        let out = run_batch(
            &calls,
            &rig.guard,
            &rig.executor,
            &mut session,
            &events,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(out.len(), 4);
        assert!(out[0].ok);
        assert_eq!(out[1].code(), Some(codes::PATH_OUTSIDE_WORKSPACE));
        assert!(out[2].ok);
        assert_eq!(out[3].code(), Some(codes::UNKNOWN_TOOL));
        assert_eq!(rig.audit.len(), 4);

        drop(events);
        let mut finished = Vec::new();
        while let Some(ev) = rx.recv().await {
            if let PresentationEvent::ToolCallFinished { call_id, .. } = ev {
                finished.push(call_id);
            }
        }
        assert_eq!(finished, vec!["c1", "c2", "c3", "c4"]);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_batch_still_answers_everything() -> anyhow::Result<()> {
        let rig = rig()?;
        let calls = vec![
            ToolCall::new("c1", "file_read", json!({"path": "a.txt"})),
            ToolCall::new("c2", "file_write", json!({"path": "new.txt", "content": "x"})),
        ];
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut session = SessionPolicy::new(true);
        let out = run_batch(
            &calls,
            &rig.guard,
            &rig.executor,
            &mut session,
            &EventSink::detached(),
            &cancel,
        )
        .await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|e| e.code() == Some(codes::CANCELLED)));
        assert!(!rig._dir.path().join("new.txt").exists());
        Ok(())
    }
}
