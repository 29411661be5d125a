use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{NaiveDate, TimeDelta};
use rust_decimal::Decimal;
use ulid::Ulid;

use carhold::clock::SystemClock;
use carhold::gateway::{GatewayError, PaymentGateway, RefundReceipt};
use carhold::model::{CarId, Payment};
use carhold::notify::NotifyHub;
use carhold::{DateRange, Engine, EngineError, Orchestrator};

struct NoopGateway;

#[async_trait]
impl PaymentGateway for NoopGateway {
    async fn refund(&self, payment: &Payment, _reason: &str) -> Result<RefundReceipt, GatewayError> {
        Ok(RefundReceipt {
            refund_id: payment.id.to_string(),
        })
    }
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn bench_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("carhold_bench");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}_{}.wal", Ulid::new()));
    let _ = std::fs::remove_file(&path);
    path
}

fn orchestrator(name: &str) -> Orchestrator {
    let engine = Engine::new(
        bench_wal_path(name),
        Arc::new(NotifyHub::new()),
        Arc::new(SystemClock),
    )
    .unwrap();
    Orchestrator::new(Arc::new(engine), Arc::new(NoopGateway), TimeDelta::minutes(15))
}

async fn add_cars(orch: &Orchestrator, n: usize) -> Vec<CarId> {
    let owner = Ulid::new();
    let mut cars = Vec::with_capacity(n);
    for _ in 0..n {
        let id = Ulid::new();
        orch.engine()
            .register_car(id, owner, Decimal::new(4500, 2))
            .await
            .unwrap();
        cars.push(id);
    }
    cars
}

/// The `i`-th disjoint two-day window starting next year, so advance never fires.
fn window(i: u32) -> DateRange {
    let base = NaiveDate::from_ymd_opt(2100, 1, 1).unwrap();
    let start = base + TimeDelta::days(i64::from(i) * 3);
    DateRange::new(start, start + TimeDelta::days(1)).unwrap()
}

async fn checkout(orch: &Orchestrator, car_id: CarId, range: DateRange) -> Result<(), EngineError> {
    let hold = orch.request_hold(Ulid::new(), car_id, range).await?;
    orch.confirm_payment(hold.id).await?;
    Ok(())
}

async fn phase1_sequential() {
    let orch = orchestrator("phase1");
    let car = add_cars(&orch, 1).await[0];
    let n = 1000;

    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        checkout(&orch, car, window(i)).await.unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = f64::from(n) / elapsed.as_secs_f64();
    println!("  {n} checkouts in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("checkout latency", &mut latencies);
}

async fn phase2_concurrent() {
    let orch = Arc::new(orchestrator("phase2"));
    let cars = add_cars(&orch, 10).await;
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..n_tasks {
        let orch = orch.clone();
        let car = cars[i % cars.len()];
        handles.push(tokio::spawn(async move {
            for j in 0..n_per_task {
                checkout(&orch, car, window(j)).await.unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks as u32 * n_per_task;
    let ops = f64::from(total) / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} checkouts = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_search_under_load() {
    let orch = Arc::new(orchestrator("phase3"));
    let cars = Arc::new(add_cars(&orch, 200).await);

    let writer = {
        let orch = orch.clone();
        let cars = cars.clone();
        tokio::spawn(async move {
            for i in 0..2000u32 {
                let car = cars[i as usize % cars.len()];
                let _ = checkout(&orch, car, window(i / 200)).await;
            }
        })
    };

    let mut latencies = Vec::new();
    let mut last = 0;
    for i in 0..500u32 {
        let t = Instant::now();
        let free = orch
            .engine()
            .list_available(window(i % 10), &cars, None)
            .await
            .unwrap();
        latencies.push(t.elapsed());
        last = free.len();
    }
    writer.await.unwrap();
    println!("  {} searches over {} cars (last result: {last} free)", latencies.len(), cars.len());
    print_latency("list_available latency", &mut latencies);
}

async fn phase4_contention() {
    let orch = Arc::new(orchestrator("phase4"));
    let car = add_cars(&orch, 1).await[0];
    let range = window(0);
    let n = 200;

    // Holds are advisory; place them directly so every renter reaches payment.
    let mut holds = Vec::with_capacity(n);
    for _ in 0..n {
        let hold = orch
            .engine()
            .create_hold(Ulid::new(), car, range, TimeDelta::minutes(15))
            .await
            .unwrap();
        holds.push(hold.id);
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for hold_id in holds {
        let orch = orch.clone();
        handles.push(tokio::spawn(async move { orch.confirm_payment(hold_id).await }));
    }
    let mut won = 0;
    let mut lost = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(EngineError::Conflict { .. }) => lost += 1,
            Err(e) => panic!("unexpected: {e}"),
        }
    }
    assert_eq!(won, 1, "exactly one renter may win the dates");
    println!(
        "  {n} racing payments: {won} won, {lost} conflicted in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    println!("=== carhold stress benchmark ===\n");

    println!("[phase 1] sequential checkout throughput");
    phase1_sequential().await;

    println!("\n[phase 2] concurrent checkout throughput");
    phase2_concurrent().await;

    println!("\n[phase 3] search latency under checkout load");
    phase3_search_under_load().await;

    println!("\n[phase 4] same-dates contention");
    phase4_contention().await;

    println!("\n=== benchmark complete ===");
}
