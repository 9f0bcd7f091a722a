use crate::limits::{MIN_SLOT_INTERVAL_MIN, PEAK_WINDOWS};
use crate::model::*;

// ── Interval arithmetic ───────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// Sweep-line algorithm: find time ranges where occupied count >= capacity.
/// Returns sorted, merged spans representing fully-saturated time ranges.
pub fn compute_saturated_spans(occupied: &[Span], capacity: u32) -> Vec<Span> {
    if occupied.is_empty() || capacity == 0 {
        return Vec::new();
    }
    if capacity == 1 {
        return merge_overlapping(occupied);
    }

    // Build sweep-line events: +1 at start, -1 at end
    let mut events: Vec<(Min, i32)> = Vec::with_capacity(occupied.len() * 2);
    for s in occupied {
        events.push((s.start, 1));
        events.push((s.end, -1));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result = Vec::new();
    let mut count: u32 = 0;
    let mut saturated_start: Option<Min> = None;

    for (time, delta) in &events {
        if *delta > 0 {
            count += *delta as u32;
        } else {
            count -= (-*delta) as u32;
        }

        if count >= capacity && saturated_start.is_none() {
            saturated_start = Some(*time);
        } else if count < capacity
            && let Some(start) = saturated_start.take()
            && *time > start
        {
            result.push(Span::new(start, *time));
        }
    }

    result
}

// ── Slot walking ──────────────────────────────────────────────────

/// Walk the open window emitting candidate slots of `slot_duration` at
/// `interval` steps, densified to 15-minute granularity inside the peak
/// windows when the requested interval is coarser. All slots start
/// `available`; the conflict detector resolves actual availability.
pub fn generate_slots(
    open: Span,
    window: Option<Span>,
    slot_duration: Min,
    interval: Min,
) -> Vec<Slot> {
    let interval = interval.max(MIN_SLOT_INTERVAL_MIN);
    let walk = match window {
        Some(w) => {
            let start = open.start.max(w.start);
            let end = open.end.min(w.end);
            if start >= end {
                return Vec::new();
            }
            Span::new(start, end)
        }
        None => open,
    };

    let mut starts: Vec<Min> = Vec::new();
    let mut t = walk.start;
    while t + slot_duration <= walk.end {
        starts.push(t);
        t += interval;
    }

    // High-demand windows get finer-grained options than the caller asked for.
    if interval > MIN_SLOT_INTERVAL_MIN {
        for peak in &PEAK_WINDOWS {
            let mut t = peak.start.max(walk.start);
            while t < peak.end.min(walk.end) {
                if t + slot_duration <= walk.end {
                    starts.push(t);
                }
                t += MIN_SLOT_INTERVAL_MIN;
            }
        }
        starts.sort();
        starts.dedup();
    }

    starts
        .into_iter()
        .map(|start| Slot {
            start,
            end: start + slot_duration,
            duration: slot_duration,
            available: true,
        })
        .collect()
}

/// Slot size for a service set: widest duration+buffer, plus the global
/// buffer from policy.
pub fn slot_duration_for(services: &[Service], global_buffer: Min) -> Min {
    services
        .iter()
        .map(|s| s.timing.duration_min + s.timing.buffer_min)
        .max()
        .unwrap_or(0)
        + global_buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        let result = subtract_intervals(&base, &remove);
        assert_eq!(result, base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        let result = subtract_intervals(&base, &remove);
        assert!(result.is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Span::new(100, 300)];
        let remove = vec![Span::new(150, 200)];
        let result = subtract_intervals(&base, &remove);
        assert_eq!(result, vec![Span::new(100, 150), Span::new(200, 300)]);
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![Span::new(100, 200), Span::new(400, 500), Span::new(800, 900)];
        let result = subtract_intervals(&base, &remove);
        assert_eq!(
            result,
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![Span::new(100, 300), Span::new(200, 400), Span::new(500, 600)];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 400), Span::new(500, 600)]);
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 300)]);
    }

    // ── compute_saturated_spans ──────────────────────────

    #[test]
    fn saturated_spans_basic() {
        let occupied = vec![Span::new(0, 100), Span::new(50, 150)];
        let sat = compute_saturated_spans(&occupied, 2);
        assert_eq!(sat, vec![Span::new(50, 100)]);
    }

    #[test]
    fn saturated_spans_no_overlap() {
        let occupied = vec![Span::new(0, 100), Span::new(200, 300)];
        let sat = compute_saturated_spans(&occupied, 2);
        assert!(sat.is_empty());
    }

    #[test]
    fn saturated_spans_capacity_one() {
        let occupied = vec![Span::new(0, 100), Span::new(200, 300)];
        let sat = compute_saturated_spans(&occupied, 1);
        assert_eq!(sat, vec![Span::new(0, 100), Span::new(200, 300)]);
    }

    #[test]
    fn saturated_spans_empty() {
        let sat = compute_saturated_spans(&[], 5);
        assert!(sat.is_empty());
    }

    // ── generate_slots ───────────────────────────────────

    const NINE: Min = 9 * 60;
    const SIX_PM: Min = 18 * 60;

    #[test]
    fn full_day_walk_fits_before_close() {
        // 60-minute service with 15-minute buffer: 75-minute slots.
        let slots = generate_slots(Span::new(NINE, SIX_PM), None, 75, 15);
        assert_eq!(slots.first().unwrap().start, NINE);
        // Last start must leave room for the slot: 16:45 + 75 = 18:00.
        assert_eq!(slots.last().unwrap().start, 16 * 60 + 45);
        assert!(slots.iter().all(|s| s.end <= SIX_PM));
        assert!(slots.iter().all(|s| s.available));
    }

    #[test]
    fn coarse_walk_densifies_peaks() {
        let slots = generate_slots(Span::new(NINE, SIX_PM), None, 60, 60);
        let starts: Vec<Min> = slots.iter().map(|s| s.start).collect();

        // Hourly outside the peaks…
        assert!(starts.contains(&NINE));
        assert!(!starts.contains(&(9 * 60 + 15)));
        // …15-minute granularity inside 10:00–12:00.
        assert!(starts.contains(&(10 * 60 + 15)));
        assert!(starts.contains(&(11 * 60 + 45)));
        // …and inside 14:00–16:00.
        assert!(starts.contains(&(15 * 60 + 45)));

        // De-duplicated and sorted.
        let mut sorted = starts.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn fine_walk_skips_peak_densification() {
        let quarter = generate_slots(Span::new(NINE, SIX_PM), None, 60, 15);
        // Every start is on the 15-minute grid from open; nothing extra
        // was injected inside the peaks.
        assert!(quarter.iter().all(|s| (s.start - NINE) % 15 == 0));
        let mut starts: Vec<Min> = quarter.iter().map(|s| s.start).collect();
        starts.dedup();
        assert_eq!(starts.len(), quarter.len());
    }

    #[test]
    fn interval_below_minimum_is_clamped() {
        let slots = generate_slots(Span::new(NINE, NINE + 60), None, 15, 5);
        let starts: Vec<Min> = slots.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![NINE, NINE + 15, NINE + 30, NINE + 45]);
    }

    #[test]
    fn window_clamps_the_walk() {
        let slots = generate_slots(
            Span::new(NINE, SIX_PM),
            Some(Span::new(13 * 60, 15 * 60)),
            30,
            30,
        );
        assert_eq!(slots.first().unwrap().start, 13 * 60);
        assert!(slots.iter().all(|s| s.end <= 15 * 60));
    }

    #[test]
    fn disjoint_window_yields_nothing() {
        let slots = generate_slots(
            Span::new(NINE, 12 * 60),
            Some(Span::new(13 * 60, 15 * 60)),
            30,
            30,
        );
        assert!(slots.is_empty());
    }

    #[test]
    fn oversized_slot_yields_nothing() {
        let slots = generate_slots(Span::new(NINE, NINE + 60), None, 90, 15);
        assert!(slots.is_empty());
    }

    #[test]
    fn slot_duration_takes_widest_service() {
        let svc = |dur, buf| Service {
            id: Ulid::new(),
            shop_id: Ulid::new(),
            name: "svc".into(),
            price: 0,
            timing: ServiceTiming { duration_min: dur, buffer_min: buf },
        };
        assert_eq!(slot_duration_for(&[svc(60, 15), svc(30, 10)], 0), 75);
        assert_eq!(slot_duration_for(&[svc(60, 15)], 5), 80);
        assert_eq!(slot_duration_for(&[], 5), 5);
    }
}
