use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::sleep;

use async_trait::async_trait;
use cadence_core::{
    AsyncStep, DataBag, Fault, RunOptions, Sequencer, StepScope, SubrunTarget, from_async, step,
};

/// One sensor reading from an incoming status report.
#[derive(Debug, Clone, Deserialize)]
struct Reading {
    address: String,
    current: f64,
}

/// Pretend store lookup latency.
async fn io_delay() {
    let ms = rand::thread_rng().gen_range(5..40);
    sleep(Duration::from_millis(ms)).await;
}

/// Find-or-create the device record named in the report.
struct DeviceLookup {
    name: String,
}

#[async_trait]
impl AsyncStep for DeviceLookup {
    async fn run(&self, _bag: DataBag, _prev: Vec<Value>) -> Result<Vec<Value>, Fault> {
        tracing::info!(device = %self.name, "incoming report");
        io_delay().await;
        Ok(vec![json!({ "name": self.name, "id": 1 })])
    }
}

/// 1 センサー分の nested run：レコード取得 → セットポイント統合 → 保存
fn sensor_steps(reading: Reading) -> Vec<Box<dyn cadence_core::Step>> {
    let fetch_reading = reading.clone();
    vec![
        step(move |scope: &StepScope, _prev: &[Value]| {
            let handle = scope.first();
            let address = fetch_reading.address.clone();
            tokio::spawn(async move {
                io_delay().await;
                // find-or-create the sensor record for this address
                handle.succeed(json!({
                    "address": address,
                    "setpoint": 19.5,
                }));
            });
            Ok(Value::Null)
        }),
        step(move |scope: &StepScope, prev: &[Value]| {
            let record = prev[0].clone();
            let setpoint = record["setpoint"].clone();
            // 共有バッグ経由で外側のステップへ伝える
            scope
                .data()
                .insert(format!("setpoint:{}", reading.address), setpoint);

            let handle = scope.first();
            let stored = json!({
                "address": reading.address.clone(),
                "last_temp": reading.current,
            });
            tokio::spawn(async move {
                io_delay().await;
                handle.succeed(stored);
            });
            Ok(Value::Null)
        }),
    ]
}

fn report_steps(report: Value) -> Vec<Box<dyn cadence_core::Step>> {
    let device_name = report["device"].as_str().unwrap_or("unknown").to_string();
    let fan_out_report = report.clone();
    vec![
        // (A) find-or-create the device record
        from_async(DeviceLookup { name: device_name }),
        // (B) one nested run per sensor, joined through a fan-out group
        step(move |scope: &StepScope, prev: &[Value]| {
            let device = prev[0].clone();
            tracing::info!(device = %device["name"], "device ready");
            let all_done = scope.group();
            let readings: Vec<Reading> = serde_json::from_value(
                fan_out_report["sensors"].clone(),
            )
            .map_err(|e| Fault::step(format!("bad report: {e}")))?;
            for reading in readings {
                scope.run_into(
                    sensor_steps(reading),
                    RunOptions::default(),
                    SubrunTarget::Handle(all_done.branch()),
                );
            }
            Ok(Value::Null)
        }),
        // (C) summarize: group slot holds one entry per sensor run
        step(|scope: &StepScope, prev: &[Value]| {
            let stored = prev[0].as_array().cloned().unwrap_or_default();
            let setpoints: Vec<Value> = stored
                .iter()
                .filter_map(|s| s["address"].as_str())
                .map(|addr| {
                    json!({
                        "address": addr,
                        "setpoint": scope.data().get(&format!("setpoint:{addr}")),
                    })
                })
                .collect();
            Ok(json!({
                "stored": stored.len(),
                "setpoints": setpoints,
            }))
        }),
    ]
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let report = json!({
        "device": "brewferm1",
        "sensors": [
            { "address": "0000066d868f", "current": 22.0 },
            { "address": "0000066d8690", "current": 18.4 },
            { "address": "0000066d8691", "current": 20.1 },
        ],
    });

    let handle = Sequencer::spawn(
        report_steps(report),
        RunOptions::default().with_timeout(Duration::from_millis(2_000)),
    );

    match handle.join().await {
        Ok(results) => {
            println!("report processed: {}", results[0]);
        }
        Err(fault) => {
            eprintln!("report failed: {fault}");
            std::process::exit(1);
        }
    }
}
