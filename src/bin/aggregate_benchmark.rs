//! smelter-bench: exercise the aggregation engine end to end.
//!
//! Usage:
//!   # Aggregate 100k synthetic order items in memory
//!   smelter-bench
//!
//!   # Four workers with disk spilling
//!   smelter-bench --workers 4 --spill-dir ./spill --flush-threshold 100000
//!
//!   # Aggregate an NDJSON file (one item per line)
//!   smelter-bench orders.jsonl

// Use MiMalloc allocator for better performance (recommended by simd-json)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use smelter::{
    aggregate, run_parallel, CancelToken, CodecKind, DimensionField, EngineConfig, Field,
    FieldRole, ItemSelector, JsonField, OncePerField, Progress, TableMapper,
};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "smelter-bench")]
#[command(about = "Aggregate synthetic or NDJSON items into star-schema tables", long_about = None)]
struct Args {
    /// NDJSON input file (synthetic items are generated if omitted)
    #[arg(value_name = "FILE")]
    input: Option<String>,

    /// Number of synthetic items to generate
    #[arg(long, default_value_t = 100_000)]
    items: usize,

    /// Worker threads (1 = single-worker driver)
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// In-memory row threshold before spilling to disk
    #[arg(long)]
    flush_threshold: Option<usize>,

    /// Spill directory (enables disk spilling)
    #[arg(long)]
    spill_dir: Option<String>,

    /// Maximum cumulative spill size in bytes
    #[arg(long)]
    max_disk_bytes: Option<u64>,

    /// Bounded item queue capacity for the parallel path
    #[arg(long, default_value_t = 1024)]
    queue_capacity: u64,

    /// Use JSON Lines instead of binary partition encoding
    #[arg(long)]
    jsonl: bool,
}

/// The standard bench job: orders keyed by id, order lines collapsing onto
/// their order, and a region dimension.
fn build_tree() -> Vec<TableMapper> {
    vec![TableMapper::new("orders", ItemSelector::Identity)
        .with_field(JsonField::new(Field::new("id", FieldRole::Key), "/id"))
        .with_field(JsonField::new(
            Field::new("customer", FieldRole::Label),
            "/customer",
        ))
        .with_field(DimensionField::new(
            "regions",
            Field::new("region_key", FieldRole::Dimension),
            vec![(
                Field::new("region", FieldRole::Dimension),
                "/region".into(),
            )],
        ))
        .with_child(
            TableMapper::new("order_lines", ItemSelector::Path("/lines".into()))
                .with_field(JsonField::new(
                    Field::new("quantity", FieldRole::Fact),
                    "/quantity",
                ))
                .with_field(OncePerField::new(
                    Field::new("order_total", FieldRole::Fact),
                    "orders",
                    "/total",
                )),
        )]
}

fn synthetic_items(count: usize) -> Vec<Value> {
    const REGIONS: [&str; 7] = [
        "north", "south", "east", "west", "central", "overseas", "unknown",
    ];
    (0..count)
        .map(|i| {
            let lines: Vec<Value> = (0..(i % 4 + 1))
                .map(|l| json!({"quantity": (l + 1) as i64}))
                .collect();
            json!({
                "id": i as i64,
                "customer": format!("customer-{}", i % 1000),
                "region": REGIONS[i % REGIONS.len()],
                "total": ((i * 31) % 97) as i64,
                "lines": lines,
            })
        })
        .collect()
}

fn read_ndjson(path: &str) -> Result<Vec<Value>> {
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("Failed to open input file: {path}"))?,
    );
    let mut items = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line")?;
        if line.trim().is_empty() {
            continue;
        }
        let mut bytes = line.into_bytes();
        let value: Value =
            simd_json::serde::from_slice(&mut bytes).context("Failed to parse JSON")?;
        items.push(value);
    }
    Ok(items)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = EngineConfig {
        flush_row_threshold: args.flush_threshold.unwrap_or(500_000),
        max_disk_bytes: args.max_disk_bytes,
        queue_capacity: args.queue_capacity as usize,
        workers: args.workers,
        spill_dir: args.spill_dir.as_ref().map(Into::into),
        codec: if args.jsonl {
            CodecKind::JsonLines
        } else {
            CodecKind::Binary
        },
    };

    let items = match &args.input {
        Some(path) => read_ndjson(path)?,
        None => synthetic_items(args.items),
    };
    let item_count = items.len();
    println!(
        "Aggregating {} items ({} workers, spill: {})",
        item_count,
        config.workers.max(1),
        config
            .spill_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "off".into()),
    );

    let progress = Progress::new().with_total(item_count as u64);
    let started = Instant::now();
    let result = if config.workers > 1 {
        run_parallel(build_tree, items, &config, &progress, &CancelToken::new())?
    } else {
        aggregate(build_tree(), items, &config)?
    };
    let elapsed = started.elapsed();

    println!("Status: {:?}", result.status);
    for table in result.into_tables() {
        let name = table.name().to_string();
        let mut rows = 0usize;
        for row in table {
            row?;
            rows += 1;
        }
        println!("  {name}: {rows} rows");
    }
    println!(
        "Done in {:.2}s ({:.0} items/s)",
        elapsed.as_secs_f64(),
        item_count as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
    );

    Ok(())
}
