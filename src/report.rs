/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::stats::{Counts, StatSample, Stats};
use anyhow::Context;
use colored::*;
use itertools::Itertools;
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};
use textplots::{Chart, Plot, Shape};

const HISTOGRAM_BUCKETS: usize = 10;

/// Nearest-rank percentile of an ascending slice.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted.get(rank.clamp(1, sorted.len()) - 1).copied()
}

fn sorted_delays(samples: &[StatSample]) -> Vec<f64> {
    samples
        .iter()
        .map(|s| s.delay)
        .sorted_by(|a, b| a.total_cmp(b))
        .collect()
}

/// Buckets delays into `buckets` equal-width bins between the smallest and largest delay and
/// returns `(bin centre, count)` pairs.
pub fn histogram(delays: &[f64], buckets: usize) -> Vec<(f32, f32)> {
    let Some((min, max)) = delays.iter().copied().minmax().into_option() else {
        return vec![];
    };
    let buckets = buckets.max(1);
    let width = ((max - min) / buckets as f64).max(f64::EPSILON);

    let counts = delays.iter().counts_by(|delay| {
        (((delay - min) / width) as usize).min(buckets - 1)
    });

    (0..buckets)
        .map(|bucket| {
            let centre = min + width * (bucket as f64 + 0.5);
            let count = counts.get(&bucket).copied().unwrap_or(0);
            (centre as f32, count as f32)
        })
        .collect()
}

/// X range covering every bar. Always at least one second wide so a lone bar still plots.
fn plot_range(bars: &[(f32, f32)]) -> Option<(f32, f32)> {
    let first = bars.first()?.0;
    let last = bars.last()?.0;
    Some((first, last.max(first + 1.0)))
}

fn fmt_secs(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.3}s", v))
        .unwrap_or_else(|| "--".to_string())
}

pub fn print_summary(stats: &Stats, counts: Counts) {
    println!("\n{}", " Summary ".reversed().green());

    let missing = counts.stopping.to_string();
    let missing = if counts.stopping > 0 {
        missing.red()
    } else {
        missing.normal()
    };

    let table = Table::builder()
        .rows(rows![
            row![
                TableCell::builder("Starting".bold()).build(),
                TableCell::builder("Running".bold()).build(),
                TableCell::builder("Stopping".bold()).build(),
                TableCell::builder("Stopped".bold()).build()
            ],
            row![
                TableCell::new(counts.starting),
                TableCell::new(counts.running),
                TableCell::new(missing),
                TableCell::new(counts.stopped)
            ]
        ])
        .style(TableStyle::rounded())
        .build();
    println!("{}", table.render());

    let start = sorted_delays(&stats.start);
    let stop = sorted_delays(&stats.stop);
    let table = Table::builder()
        .rows(rows![
            row![
                TableCell::builder("Delay".bold()).build(),
                TableCell::builder("Samples".bold()).build(),
                TableCell::builder("p50".bold()).build(),
                TableCell::builder("p90".bold()).build(),
                TableCell::builder("p99".bold()).build(),
                TableCell::builder("Max".bold()).build()
            ],
            row![
                TableCell::new("start"),
                TableCell::new(start.len()),
                TableCell::new(fmt_secs(percentile(&start, 50.0))),
                TableCell::new(fmt_secs(percentile(&start, 90.0))),
                TableCell::new(fmt_secs(percentile(&start, 99.0))),
                TableCell::new(fmt_secs(start.last().copied()))
            ],
            row![
                TableCell::new("stop"),
                TableCell::new(stop.len()),
                TableCell::new(fmt_secs(percentile(&stop, 50.0))),
                TableCell::new(fmt_secs(percentile(&stop, 90.0))),
                TableCell::new(fmt_secs(percentile(&stop, 99.0))),
                TableCell::new(fmt_secs(stop.last().copied()))
            ]
        ])
        .style(TableStyle::rounded())
        .build();
    println!("{}", table.render());
}

pub fn print_histogram(stats: &Stats) {
    let delays = sorted_delays(&stats.start);
    let bars = histogram(&delays, HISTOGRAM_BUCKETS);
    let Some((xmin, xmax)) = plot_range(&bars) else {
        println!("{}", "no unit reached running, nothing to plot".bright_black());
        return;
    };

    println!("\n{}", " Histogram starting units delay (s) ".reversed().green());
    Chart::new(120, 40, xmin, xmax)
        .lineplot(&Shape::Bars(&bars))
        .display();
}

/// Writes the statistics snapshot as JSON to `target`, or to stdout when `target` is `-`.
pub fn dump_json(stats: &Stats, target: &str) -> anyhow::Result<()> {
    if target == "-" {
        return write_json(stats, io::stdout().lock());
    }

    let path = Path::new(target);
    let file = File::create(path).context(format!("Unable to create {}", path.display()))?;
    write_json(stats, BufWriter::new(file))
}

fn write_json<W: Write>(stats: &Stats, mut writer: W) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut writer, stats).context("Unable to serialize statistics")?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{LifecycleStore, WorkerId};

    #[test]
    fn percentile_uses_nearest_rank() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert_eq!(percentile(&sorted, 50.0), Some(5.0));
        assert_eq!(percentile(&sorted, 90.0), Some(9.0));
        assert_eq!(percentile(&sorted, 99.0), Some(10.0));
        assert_eq!(percentile(&sorted, 0.0), Some(1.0));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn histogram_counts_every_delay() {
        let delays = [0.0, 0.1, 0.2, 0.9, 1.0];
        let bars = histogram(&delays, 5);
        assert_eq!(bars.len(), 5);
        assert_eq!(bars.iter().map(|(_, n)| *n).sum::<f32>(), 5.0);
        assert_eq!(bars[0].1, 2.0);
        assert_eq!(bars[4].1, 2.0);

        let single = histogram(&[0.5], 3);
        assert_eq!(single.iter().map(|(_, n)| *n).sum::<f32>(), 1.0);
        assert!(histogram(&[], 3).is_empty());
    }

    #[test]
    fn lone_slow_delay_still_gets_a_plot_range() {
        let bars = histogram(&[2.5], HISTOGRAM_BUCKETS);
        let (xmin, xmax) = plot_range(&bars).expect("one delay gives bars");
        assert!(xmax - xmin >= 1.0);
        assert!(bars.iter().all(|(x, _)| *x >= xmin && *x <= xmax));

        let bars = histogram(&[0.0, 10.0], HISTOGRAM_BUCKETS);
        let (xmin, xmax) = plot_range(&bars).expect("two delays give bars");
        assert_eq!((xmin, xmax), (bars[0].0, bars[HISTOGRAM_BUCKETS - 1].0));

        assert_eq!(plot_range(&[]), None);
    }

    #[test]
    fn stats_dump_as_json() -> anyhow::Result<()> {
        let store = LifecycleStore::new();
        let id = WorkerId::generate();
        store.request_start(id.clone())?;
        store.mark_running(id.as_str())?;

        let path = std::env::temp_dir().join(format!("fleemmer-{}.json", nanoid::nanoid!(8)));
        dump_json(&store.stats(), &path.to_string_lossy())?;

        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        std::fs::remove_file(&path)?;

        assert_eq!(json["start"][0]["id"], id.as_str());
        assert_eq!(json["start"][0]["running"], 1);
        assert!(json["stop"].as_array().is_some_and(|a| a.is_empty()));
        Ok(())
    }
}
