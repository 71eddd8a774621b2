//! Lane assignment and batch construction. Short and long units batch by
//! weight (short ones grouped by record family so related names share a
//! request); very long units run alone in their own lane.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::utils::RunOptions;

use super::prepare::WorkUnit;

pub const SHORT_LANE_MIN: usize = 1500;
pub const SHORT_LANE_MAX: usize = 6000;
pub const LONG_BATCH_MAX_ITEMS: usize = 8;
const SOURCE_STEM_MAX: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Short,
    Long,
    VeryLong,
}

impl Lane {
    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Short => "short",
            Lane::Long => "long",
            Lane::VeryLong => "very_long",
        }
    }
}

#[derive(Debug)]
pub struct Batch {
    pub lane: Lane,
    pub units: Vec<WorkUnit>,
    pub weight: usize,
}

impl Batch {
    fn new(lane: Lane, units: Vec<WorkUnit>) -> Self {
        let weight = units.iter().map(|u| u.weight).sum();
        Self { lane, units, weight }
    }
}

/// The three lane queues a run's workers drain. `remaining` counts
/// batches not yet dequeued per lane, which drives reserved-slot
/// release on the very-long gate.
#[derive(Debug, Default)]
pub struct LaneQueues {
    short: Mutex<VecDeque<Batch>>,
    long: Mutex<VecDeque<Batch>>,
    very_long: Mutex<VecDeque<Batch>>,
    remaining: [AtomicUsize; 3],
}

fn lane_index(lane: Lane) -> usize {
    match lane {
        Lane::Short => 0,
        Lane::Long => 1,
        Lane::VeryLong => 2,
    }
}

impl LaneQueues {
    fn queue(&self, lane: Lane) -> &Mutex<VecDeque<Batch>> {
        match lane {
            Lane::Short => &self.short,
            Lane::Long => &self.long,
            Lane::VeryLong => &self.very_long,
        }
    }

    /// Dequeues a batch and decrements the lane's remaining count.
    pub fn pop(&self, lane: Lane) -> Option<Batch> {
        let batch = self.queue(lane).lock().ok().and_then(|mut q| q.pop_front());
        if batch.is_some() {
            self.decrement(lane);
        }
        batch
    }

    pub fn len(&self, lane: Lane) -> usize {
        self.queue(lane).lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        [Lane::Short, Lane::Long, Lane::VeryLong]
            .iter()
            .all(|&lane| self.len(lane) == 0)
    }

    pub fn remaining(&self, lane: Lane) -> usize {
        self.remaining[lane_index(lane)].load(Ordering::SeqCst)
    }

    fn decrement(&self, lane: Lane) -> usize {
        let counter = &self.remaining[lane_index(lane)];
        let mut current = counter.load(Ordering::SeqCst);
        while current > 0 {
            match counter.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return current - 1,
                Err(observed) => current = observed,
            }
        }
        0
    }

    fn push_all(&self, lane: Lane, batches: Vec<Batch>) {
        self.remaining[lane_index(lane)].fetch_add(batches.len(), Ordering::SeqCst);
        if let Ok(mut q) = self.queue(lane).lock() {
            q.extend(batches);
        }
    }
}

pub fn short_lane_threshold(max_chars: usize) -> usize {
    (max_chars / 3).clamp(SHORT_LANE_MIN, SHORT_LANE_MAX)
}

/// Builds the lane queues from prepared units. Batches come out sorted
/// by ascending weight so workers warm up on cheap requests.
pub fn build_queues(mut units: Vec<WorkUnit>, options: &RunOptions) -> LaneQueues {
    let queues = LaneQueues::default();
    let max_chars = options.max_chars_per_request.max(1);
    let short_max = short_lane_threshold(max_chars);

    let mut very_long = Vec::new();
    let mut long = Vec::new();
    let mut short = Vec::new();
    for unit in units.drain(..) {
        if unit.weight > max_chars {
            very_long.push(unit);
        } else if unit.weight > short_max {
            long.push(unit);
        } else {
            short.push(unit);
        }
    }

    sort_for_batching(&mut short);
    sort_for_batching(&mut long);

    let mut short_batches: Vec<Batch> =
        chunk_by_group(short, options.batch_size.max(1), max_chars)
            .into_iter()
            .map(|units| Batch::new(Lane::Short, units))
            .collect();
    let long_max_items = options.batch_size.clamp(1, LONG_BATCH_MAX_ITEMS);
    let mut long_batches: Vec<Batch> = chunk_by(long, long_max_items, max_chars)
        .into_iter()
        .map(|units| Batch::new(Lane::Long, units))
        .collect();
    let very_long_batches: Vec<Batch> = very_long
        .into_iter()
        .map(|unit| Batch::new(Lane::VeryLong, vec![unit]))
        .collect();

    short_batches.sort_by_key(|b| b.weight);
    long_batches.sort_by_key(|b| b.weight);

    tracing::debug!(
        short = short_batches.len(),
        long = long_batches.len(),
        very_long = very_long_batches.len(),
        "lane queues built"
    );
    queues.push_all(Lane::Short, short_batches);
    queues.push_all(Lane::Long, long_batches);
    queues.push_all(Lane::VeryLong, very_long_batches);
    queues
}

fn sort_for_batching(units: &mut [WorkUnit]) {
    units.sort_by(|a, b| {
        group_key(a)
            .cmp(&group_key(b))
            .then_with(|| rec_base(a.rec.as_deref()).cmp(&rec_base(b.rec.as_deref())))
            .then_with(|| a.weight.cmp(&b.weight))
            .then_with(|| a.original_index.cmp(&b.original_index))
    });
}

/// Family key used to keep related strings in one batch: editor-id stem
/// when present, otherwise a stem of the source text.
pub fn group_key(unit: &WorkUnit) -> String {
    match unit.edid.as_deref().map(normalize_edid_stem) {
        Some(stem) if !stem.is_empty() => stem,
        _ => normalize_source_stem(&unit.source),
    }
}

pub fn normalize_edid_stem(edid: &str) -> String {
    let mut s = edid.trim();
    s = s.trim_end_matches(|c: char| c.is_ascii_digit());
    s = s.trim_end_matches(['_', '-', ' ']);
    s.to_lowercase()
}

pub fn normalize_source_stem(source: &str) -> String {
    let trimmed = source.trim();
    let mut stem = trimmed;
    for separator in [" - ", " – ", " — ", ": ", " (", " ["] {
        if let Some(idx) = stem.find(separator) {
            stem = &stem[..idx];
        }
    }
    let stem: String = stem.chars().take(SOURCE_STEM_MAX).collect();
    stem.trim().to_lowercase()
}

pub fn rec_base(rec: Option<&str>) -> String {
    rec.map(|r| {
        r.split(':')
            .next()
            .unwrap_or(r)
            .trim()
            .to_uppercase()
    })
    .unwrap_or_default()
}

/// Greedy weight/count-bounded chunking; a batch never comes out empty.
pub fn chunk_by<T>(items: Vec<T>, max_items: usize, max_weight: usize) -> Vec<Vec<T>>
where
    T: HasWeight,
{
    let mut chunks = Vec::new();
    let mut batch: Vec<T> = Vec::new();
    let mut weight = 0usize;
    for item in items {
        let w = item.weight();
        if !batch.is_empty() && (batch.len() >= max_items || weight + w > max_weight) {
            chunks.push(std::mem::take(&mut batch));
            weight = 0;
        }
        weight += w;
        batch.push(item);
    }
    if !batch.is_empty() {
        chunks.push(batch);
    }
    chunks
}

/// Like [`chunk_by`] but also flushes whenever the group key changes.
pub fn chunk_by_group(
    items: Vec<WorkUnit>,
    max_items: usize,
    max_weight: usize,
) -> Vec<Vec<WorkUnit>> {
    let mut chunks = Vec::new();
    let mut batch: Vec<WorkUnit> = Vec::new();
    let mut weight = 0usize;
    let mut current_group: Option<String> = None;

    for item in items {
        let w = item.weight;
        let group = group_key(&item);
        let group_changed = !batch.is_empty()
            && current_group
                .as_deref()
                .is_some_and(|g| !g.eq_ignore_ascii_case(&group));
        if group_changed || (!batch.is_empty() && (batch.len() >= max_items || weight + w > max_weight))
        {
            chunks.push(std::mem::take(&mut batch));
            weight = 0;
            current_group = None;
        }
        if batch.is_empty() {
            current_group = Some(group);
        }
        weight += w;
        batch.push(item);
    }
    if !batch.is_empty() {
        chunks.push(batch);
    }
    chunks
}

pub trait HasWeight {
    fn weight(&self) -> usize;
}

impl HasWeight for WorkUnit {
    fn weight(&self) -> usize {
        self.weight
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::text::glossary::GlossaryApplication;
    use crate::text::mask::MaskedText;

    use super::*;

    fn unit(id: i64, source: &str, edid: Option<&str>, weight: usize) -> WorkUnit {
        WorkUnit {
            id,
            source: source.to_string(),
            masked: source.to_string(),
            mask: MaskedText {
                text: source.to_string(),
                token_to_original: HashMap::new(),
            },
            glossary: GlossaryApplication {
                text: source.to_string(),
                token_to_target: HashMap::new(),
                token_to_source: HashMap::new(),
                prompt_pairs: Vec::new(),
            },
            session_targets: HashMap::new(),
            session_sources: HashMap::new(),
            rec: Some("WEAP:FULL".to_string()),
            edid: edid.map(str::to_string),
            weight,
            original_index: id as usize,
        }
    }

    fn options_with(batch_size: usize, max_chars: usize) -> RunOptions {
        RunOptions {
            batch_size,
            max_chars_per_request: max_chars,
            ..RunOptions::default()
        }
    }

    #[test]
    fn lane_assignment_by_weight() {
        let opts = options_with(20, 9000);
        // short_max = clamp(3000, 1500, 6000) = 3000
        let units = vec![
            unit(1, "a", None, 100),
            unit(2, "b", None, 3001),
            unit(3, "c", None, 9001),
        ];
        let queues = build_queues(units, &opts);
        assert_eq!(queues.remaining(Lane::Short), 1);
        assert_eq!(queues.remaining(Lane::Long), 1);
        assert_eq!(queues.remaining(Lane::VeryLong), 1);
        assert_eq!(queues.pop(Lane::VeryLong).unwrap().units.len(), 1);
    }

    #[test]
    fn chunk_by_respects_count_and_weight() {
        let items: Vec<WorkUnit> = (0..5).map(|i| unit(i, "x", None, 10)).collect();
        let chunks = chunk_by(items, 2, 1000);
        assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), [2, 2, 1]);

        let heavy = vec![unit(1, "x", None, 80), unit(2, "y", None, 30)];
        let chunks = chunk_by(heavy, 10, 100);
        assert_eq!(chunks.len(), 2);

        // An oversized single item still gets its own chunk.
        let oversized = vec![unit(1, "x", None, 500)];
        assert_eq!(chunk_by(oversized, 10, 100).len(), 1);
    }

    #[test]
    fn group_change_flushes_batch() {
        let items = vec![
            unit(1, "Iron Sword", Some("WeapIron01"), 10),
            unit(2, "Iron Axe", Some("WeapIron02"), 10),
            unit(3, "Glass Bow", Some("WeapGlass01"), 10),
        ];
        let chunks = chunk_by_group(items, 10, 1000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 2); // both weapiron stems
        assert_eq!(chunks[1][0].id, 3);
    }

    #[test]
    fn edid_stem_strips_trailing_digits_and_separators() {
        assert_eq!(normalize_edid_stem("WeapIronSword01"), "weapironsword");
        assert_eq!(normalize_edid_stem("MQ_Intro_02"), "mq_intro");
        assert_eq!(normalize_edid_stem("Guard"), "guard");
    }

    #[test]
    fn source_stem_cuts_at_separators() {
        assert_eq!(normalize_source_stem("Iron Sword - Enchanted"), "iron sword");
        assert_eq!(normalize_source_stem("Potion: Healing"), "potion");
        assert_eq!(normalize_source_stem("Scroll (Lesser)"), "scroll");
    }

    #[test]
    fn batches_sorted_by_ascending_weight() {
        let opts = options_with(1, 9000);
        let units = vec![
            unit(1, "aaa", Some("A01"), 300),
            unit(2, "bbb", Some("B01"), 100),
            unit(3, "ccc", Some("C01"), 200),
        ];
        let queues = build_queues(units, &opts);
        let weights: Vec<usize> = std::iter::from_fn(|| queues.pop(Lane::Short))
            .map(|b| b.weight)
            .collect();
        assert_eq!(weights, [100, 200, 300]);
    }

    #[test]
    fn pop_counts_down_remaining() {
        let opts = options_with(1, 9000);
        let queues = build_queues(vec![unit(1, "a", None, 10), unit(2, "b", None, 10)], &opts);
        assert_eq!(queues.remaining(Lane::Short), 2);
        queues.pop(Lane::Short);
        assert_eq!(queues.remaining(Lane::Short), 1);
        queues.pop(Lane::Short);
        assert_eq!(queues.remaining(Lane::Short), 0);
        assert!(queues.pop(Lane::Short).is_none());
        assert_eq!(queues.remaining(Lane::Short), 0);
    }
}
