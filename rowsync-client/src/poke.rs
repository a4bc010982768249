//! Client-side poke pipeline: accumulate, merge, apply.
//!
//! Frames arrive interleaved with other traffic; the accumulator rebuilds
//! whole pokes from start/part/end sequences. Committed pokes buffer until a
//! debounce tick merges them into one and hands the result to the consumer
//! under a lock that serializes applies - out-of-order applies would corrupt
//! the base-cookie chain.

use async_trait::async_trait;
use rowsync_core::models::{
    poke::{Poke, PokeEnd, PokePart, PokeStart, ProtocolError, BASE_COOKIE_MISMATCH},
    version::CvrVersion,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// One frame tick; flushes the merge buffer shortly after frames stop
/// arriving, keeping reconnect bursts to a single apply.
pub const FRAME_TICK: Duration = Duration::from_millis(16);

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum PokeError {
    /// The pipeline cleared its state; the caller should reconnect.
    #[error(transparent)]
    Recoverable(#[from] ProtocolError),
    #[error("poke apply failed: {0}")]
    Fatal(String),
}

/// Consumer of merged pokes, e.g. the local database the client renders from.
/// An apply error whose message contains [`BASE_COOKIE_MISMATCH`] is treated
/// as recoverable; anything else is fatal.
#[async_trait]
pub trait PokeApply: Send + Sync {
    async fn apply(&self, poke: Poke) -> Result<(), String>;
}

/// Rebuilds pokes from their frames.
#[derive(Default)]
pub struct PokeAccumulator {
    receiving: Option<Poke>,
    buffer: Vec<Poke>,
}

impl PokeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_start(&mut self, start: PokeStart) -> Result<(), ProtocolError> {
        if let Some(receiving) = self.receiving.take() {
            self.buffer.clear();
            return Err(ProtocolError::PokeIdMismatch {
                receiving: receiving.poke_id,
                got: start.poke_id,
            });
        }
        self.receiving = Some(Poke {
            poke_id: start.poke_id,
            base_cookie: start.base_cookie,
            cookie: start.cookie,
            parts: Vec::new(),
        });
        Ok(())
    }

    pub fn handle_part(&mut self, part: PokePart) -> Result<(), ProtocolError> {
        match &mut self.receiving {
            Some(receiving) if receiving.poke_id == part.poke_id => {
                receiving.parts.push(part);
                Ok(())
            }
            other => {
                let receiving = other
                    .take()
                    .map(|poke| poke.poke_id)
                    .unwrap_or_default();
                self.buffer.clear();
                Err(ProtocolError::PokeIdMismatch { receiving, got: part.poke_id })
            }
        }
    }

    /// Commits the receiving poke to the buffer, or drops it on cancel.
    pub fn handle_end(&mut self, end: PokeEnd) -> Result<(), ProtocolError> {
        match self.receiving.take() {
            Some(receiving) if receiving.poke_id == end.poke_id => {
                if end.cancel {
                    debug!(poke_id = %end.poke_id, "poke cancelled");
                } else {
                    self.buffer.push(receiving);
                }
                Ok(())
            }
            other => {
                let receiving = other.map(|poke| poke.poke_id).unwrap_or_default();
                self.buffer.clear();
                Err(ProtocolError::PokeIdMismatch { receiving, got: end.poke_id })
            }
        }
    }

    pub fn take_buffer(&mut self) -> Vec<Poke> {
        std::mem::take(&mut self.buffer)
    }

    pub fn clear(&mut self) {
        self.receiving = None;
        self.buffer.clear();
    }
}

fn parse_cookie(raw: &str) -> Result<CvrVersion, ProtocolError> {
    raw.parse()
        .map_err(|_| ProtocolError::Malformed(format!("unparseable cookie `{raw}`")))
}

/// Merges buffered pokes into one whose base cookie is the first entry's and
/// whose cookie is the last entry's.
///
/// Validates the chain: each poke must extend the state the previous one
/// leaves behind (`base_cookie <= previous cookie`); a gap is fatal to the
/// pipeline. Last-mutation-id changes are folded last-writer-wins by part
/// order and carried on the first merged part; row, query and client patches
/// keep their intra-part order untouched.
pub fn merge_pokes(pokes: &[Poke]) -> Result<Option<Poke>, ProtocolError> {
    let Some(first) = pokes.first() else {
        return Ok(None);
    };
    let mut parts: Vec<PokePart> = Vec::new();
    let mut lmids: BTreeMap<String, u64> = BTreeMap::new();
    let mut held = parse_cookie(&first.cookie)?;

    for (i, poke) in pokes.iter().enumerate() {
        if i > 0 {
            let base = match &poke.base_cookie {
                Some(raw) => parse_cookie(raw)?,
                None => CvrVersion::min(),
            };
            if base > held {
                return Err(ProtocolError::CookieGap {
                    held: Some(held.to_string()),
                    base: Some(base.to_string()),
                });
            }
            held = parse_cookie(&poke.cookie)?;
        }
        for part in &poke.parts {
            let mut part = part.clone();
            lmids.append(&mut part.last_mutation_id_changes);
            if !part.is_empty() {
                parts.push(part);
            }
        }
    }

    let last = pokes.last().expect("non-empty checked above");
    let poke_id = last.poke_id.clone();
    for part in &mut parts {
        part.poke_id = poke_id.clone();
    }
    if !lmids.is_empty() {
        let mut lead = PokePart::new(&poke_id);
        lead.last_mutation_id_changes = lmids;
        parts.insert(0, lead);
    }

    Ok(Some(Poke {
        poke_id,
        base_cookie: first.base_cookie.clone(),
        cookie: last.cookie.clone(),
        parts,
    }))
}

/// Ties the accumulator, the debounce tick and the consumer together.
pub struct PokePipeline<A: PokeApply + 'static> {
    accumulator: Mutex<PokeAccumulator>,
    /// Serializes applies; held across the consumer call on purpose.
    apply_lock: Mutex<()>,
    consumer: A,
    flush_scheduled: AtomicBool,
    errors: mpsc::UnboundedSender<PokeError>,
}

impl<A: PokeApply + 'static> PokePipeline<A> {
    /// The returned receiver surfaces pipeline errors: recoverable ones mean
    /// "reconnect", fatal ones mean the consumer is corrupt.
    pub fn new(consumer: A) -> (Arc<Self>, mpsc::UnboundedReceiver<PokeError>) {
        let (errors, error_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(PokePipeline {
            accumulator: Mutex::new(PokeAccumulator::new()),
            apply_lock: Mutex::new(()),
            consumer,
            flush_scheduled: AtomicBool::new(false),
            errors,
        });
        (pipeline, error_rx)
    }

    pub async fn handle_start(self: &Arc<Self>, start: PokeStart) {
        let res = self.accumulator.lock().await.handle_start(start);
        self.forward(res);
    }

    pub async fn handle_part(self: &Arc<Self>, part: PokePart) {
        let res = self.accumulator.lock().await.handle_part(part);
        self.forward(res);
    }

    /// Commits the poke and schedules a debounced flush.
    pub async fn handle_end(self: &Arc<Self>, end: PokeEnd) {
        let res = self.accumulator.lock().await.handle_end(end);
        self.forward(res);
        if !self.flush_scheduled.swap(true, Ordering::AcqRel) {
            let pipeline = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(FRAME_TICK).await;
                pipeline.flush_scheduled.store(false, Ordering::Release);
                if let Err(err) = pipeline.flush().await {
                    let _ = pipeline.errors.send(err);
                }
            });
        }
    }

    /// Merges and applies everything buffered. Public so tests and drains on
    /// disconnect can flush deterministically.
    pub async fn flush(&self) -> Result<(), PokeError> {
        let _guard = self.apply_lock.lock().await;
        let buffered = self.accumulator.lock().await.take_buffer();
        let Some(merged) = merge_pokes(&buffered)? else {
            return Ok(());
        };
        debug!(poke_id = %merged.poke_id, parts = merged.parts.len(), "applying merged poke");
        if let Err(message) = self.consumer.apply(merged).await {
            self.accumulator.lock().await.clear();
            if message.contains(BASE_COOKIE_MISMATCH) {
                warn!(%message, "apply raced a newer state, reconnecting");
                return Err(ProtocolError::UnexpectedBaseCookie(message).into());
            }
            return Err(PokeError::Fatal(message));
        }
        Ok(())
    }

    fn forward(&self, res: Result<(), ProtocolError>) {
        if let Err(err) = res {
            warn!(%err, "poke pipeline cleared");
            let _ = self.errors.send(PokeError::Recoverable(err));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::btreemap;
    use rowsync_core::models::poke::{QueryPatchOp, RowPatchOp};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn start(poke_id: &str, base: Option<&str>, cookie: &str) -> PokeStart {
        PokeStart {
            poke_id: poke_id.to_string(),
            base_cookie: base.map(str::to_string),
            cookie: cookie.to_string(),
            schema_versions: None,
        }
    }

    fn row_part(poke_id: &str, key: &str) -> PokePart {
        let mut part = PokePart::new(poke_id);
        part.rows_patch.push(RowPatchOp::Put {
            table_name: "issues".to_string(),
            value: json!({"id": key}),
        });
        part
    }

    fn end(poke_id: &str) -> PokeEnd {
        PokeEnd { poke_id: poke_id.to_string(), cancel: false }
    }

    fn poke(base: Option<&str>, cookie: &str, parts: Vec<PokePart>) -> Poke {
        Poke {
            poke_id: cookie.to_string(),
            base_cookie: base.map(str::to_string),
            cookie: cookie.to_string(),
            parts,
        }
    }

    #[test]
    fn test_accumulator_round_trip() {
        let mut acc = PokeAccumulator::new();

        acc.handle_start(start("a1", None, "a1")).unwrap();
        acc.handle_part(row_part("a1", "1")).unwrap();
        acc.handle_part(row_part("a1", "2")).unwrap();
        acc.handle_end(end("a1")).unwrap();

        let buffer = acc.take_buffer();
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer[0].parts.len(), 2);
    }

    #[test]
    fn test_accumulator_rejects_mismatched_part() {
        let mut acc = PokeAccumulator::new();
        acc.handle_start(start("a1", None, "a1")).unwrap();

        let res = acc.handle_part(row_part("a2", "1"));

        assert_eq!(
            res,
            Err(ProtocolError::PokeIdMismatch { receiving: "a1".to_string(), got: "a2".to_string() })
        );
        // State cleared: a new start is accepted.
        acc.handle_start(start("a3", None, "a3")).unwrap();
    }

    #[test]
    fn test_cancelled_poke_is_dropped() {
        let mut acc = PokeAccumulator::new();
        acc.handle_start(start("a1", None, "a1")).unwrap();
        acc.handle_part(row_part("a1", "1")).unwrap();

        acc.handle_end(PokeEnd { poke_id: "a1".to_string(), cancel: true })
            .unwrap();

        assert!(acc.take_buffer().is_empty());
    }

    #[test]
    fn test_merge_spans_first_base_to_last_cookie() {
        let pokes = vec![
            poke(None, "a1", vec![row_part("a1", "1")]),
            poke(Some("a1"), "a2", vec![row_part("a2", "2")]),
            poke(Some("a2"), "a3", vec![row_part("a3", "3")]),
        ];

        let merged = merge_pokes(&pokes).unwrap().unwrap();

        assert_eq!(merged.base_cookie, None);
        assert_eq!(merged.cookie, "a3");
        assert_eq!(merged.poke_id, "a3");
        assert_eq!(merged.parts.len(), 3);
        assert!(merged.parts.iter().all(|p| p.poke_id == "a3"));
        // Intra-part order preserved.
        let keys: Vec<_> = merged
            .parts
            .iter()
            .flat_map(|p| p.rows_patch.iter())
            .map(|op| match op {
                RowPatchOp::Put { value, .. } => value["id"].as_str().unwrap().to_string(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_merge_overlapping_base_is_allowed() {
        // A reconnect can replay a poke whose base precedes what we hold.
        let pokes = vec![
            poke(None, "a2", vec![row_part("a2", "1")]),
            poke(Some("a1"), "a3", vec![row_part("a3", "2")]),
        ];

        assert!(merge_pokes(&pokes).unwrap().is_some());
    }

    #[test]
    fn test_merge_detects_cookie_gap() {
        let pokes = vec![
            poke(None, "a2", vec![row_part("a2", "1")]),
            poke(Some("a4"), "a5", vec![row_part("a5", "2")]),
        ];

        let res = merge_pokes(&pokes);

        assert_eq!(
            res,
            Err(ProtocolError::CookieGap {
                held: Some("a2".to_string()),
                base: Some("a4".to_string()),
            })
        );
    }

    #[test]
    fn test_merge_lmid_changes_are_last_writer_wins() {
        let mut part_a = PokePart::new("a1");
        part_a.last_mutation_id_changes = btreemap! { "c1".to_string() => 1, "c2".to_string() => 7 };
        let mut part_b = PokePart::new("a2");
        part_b.last_mutation_id_changes = btreemap! { "c1".to_string() => 3 };
        let pokes = vec![
            poke(None, "a1", vec![part_a]),
            poke(Some("a1"), "a2", vec![part_b]),
        ];

        let merged = merge_pokes(&pokes).unwrap().unwrap();

        assert_eq!(
            merged.parts[0].last_mutation_id_changes,
            btreemap! { "c1".to_string() => 3, "c2".to_string() => 7 }
        );
    }

    #[test]
    fn test_merge_preserves_query_patches() {
        let mut part = PokePart::new("a1");
        part.got_queries_patch
            .push(QueryPatchOp::Del { hash: "q1".to_string() });
        let pokes = vec![poke(None, "a1", vec![part])];

        let merged = merge_pokes(&pokes).unwrap().unwrap();

        assert_eq!(merged.parts[0].got_queries_patch.len(), 1);
    }

    struct RecordingConsumer {
        applied: StdMutex<Vec<Poke>>,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl PokeApply for RecordingConsumer {
        async fn apply(&self, poke: Poke) -> Result<(), String> {
            if let Some(message) = &self.fail_with {
                return Err(message.clone());
            }
            self.applied.lock().unwrap().push(poke);
            Ok(())
        }
    }

    fn consumer(fail_with: Option<String>) -> RecordingConsumer {
        RecordingConsumer { applied: StdMutex::new(Vec::new()), fail_with }
    }

    #[tokio::test]
    async fn test_pipeline_applies_merged_poke() {
        let (pipeline, _errors) = PokePipeline::new(consumer(None));

        pipeline.handle_start(start("a1", None, "a1")).await;
        pipeline.handle_part(row_part("a1", "1")).await;
        pipeline.handle_end(end("a1")).await;
        pipeline.handle_start(start("a2", Some("a1"), "a2")).await;
        pipeline.handle_part(row_part("a2", "2")).await;
        pipeline.handle_end(end("a2")).await;
        pipeline.flush().await.unwrap();

        let applied = pipeline.consumer.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].cookie, "a2");
        assert_eq!(applied[0].parts.len(), 2);
    }

    #[tokio::test]
    async fn test_pipeline_base_cookie_mismatch_is_recoverable() {
        let (pipeline, _errors) =
            PokePipeline::new(consumer(Some(format!("{BASE_COOKIE_MISMATCH}: held a9"))));

        pipeline.handle_start(start("a1", None, "a1")).await;
        pipeline.handle_part(row_part("a1", "1")).await;
        pipeline.handle_end(end("a1")).await;
        let res = pipeline.flush().await;

        assert!(matches!(res, Err(PokeError::Recoverable(_))));
    }

    #[tokio::test]
    async fn test_pipeline_other_apply_errors_are_fatal() {
        let (pipeline, _errors) = PokePipeline::new(consumer(Some("disk on fire".to_string())));

        pipeline.handle_start(start("a1", None, "a1")).await;
        pipeline.handle_end(end("a1")).await;
        let res = pipeline.flush().await;

        assert_eq!(res, Err(PokeError::Fatal("disk on fire".to_string())));
    }

    #[tokio::test]
    async fn test_debounced_flush_applies_once() {
        tokio::time::pause();
        let (pipeline, _errors) = PokePipeline::new(consumer(None));

        pipeline.handle_start(start("a1", None, "a1")).await;
        pipeline.handle_end(end("a1")).await;
        pipeline.handle_start(start("a2", Some("a1"), "a2")).await;
        pipeline.handle_end(end("a2")).await;
        tokio::time::sleep(FRAME_TICK * 4).await;

        let applied = pipeline.consumer.applied.lock().unwrap();
        assert_eq!(applied.len(), 1, "one merged apply for both pokes");
    }
}
