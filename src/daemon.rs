use anyhow::{bail, Context, Result};
use jbdbms_lib::protocol;
use jbdbms_lib::serialport::SerialJbdBms;
use log::{error, info, warn};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

use crate::{commandline, mqtt};

/// Status with the values the raw fields encode.
#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    #[serde(flatten)]
    status: &'a protocol::Status,
    date: String,
    balance: String,
    faults: Vec<String>,
    temperatures_celsius: Vec<f32>,
}

impl<'a> StatusReport<'a> {
    fn new(status: &'a protocol::Status) -> Self {
        Self {
            status,
            date: status.production_date.to_string(),
            balance: status.balance(),
            faults: status.faults().iter().map(ToString::to_string).collect(),
            temperatures_celsius: status.temperatures_celsius(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FetchedData {
    Status(protocol::Status),
    Cells(protocol::Cells),
    Hardware(protocol::Hardware),
}

impl FetchedData {
    fn to_json_value(&self) -> Result<serde_json::Value> {
        match self {
            FetchedData::Status(s) => serde_json::to_value(StatusReport::new(s)).map_err(Into::into),
            FetchedData::Cells(s) => serde_json::to_value(s).map_err(Into::into),
            FetchedData::Hardware(s) => serde_json::to_value(s).map_err(Into::into),
        }
    }

    fn as_debug_string(&self) -> String {
        match self {
            FetchedData::Status(s) => format!("{:?}", StatusReport::new(s)),
            FetchedData::Cells(s) => format!("{s:?}"),
            FetchedData::Hardware(s) => format!("{s:?}"),
        }
    }
}

type Fetch = Box<dyn Fn(&mut SerialJbdBms) -> Result<FetchedData>>;

fn get_metrics<'a>() -> HashMap<&'a str, Fetch> {
    let mut metrics: HashMap<&'a str, Fetch> = HashMap::new();
    metrics.insert(
        "status",
        Box::new(|bms| Ok(bms.get_status().map(FetchedData::Status)?)),
    );
    metrics.insert(
        "cells",
        Box::new(|bms| Ok(bms.get_cells().map(FetchedData::Cells)?)),
    );
    metrics.insert(
        "hardware",
        Box::new(|bms| Ok(bms.get_hardware().map(FetchedData::Hardware)?)),
    );
    metrics
}

/// Drops every entry that equals the previously emitted value and remembers the rest.
fn retain_changed(
    fetched_data: &mut HashMap<String, FetchedData>,
    emitted: &mut HashMap<String, FetchedData>,
) {
    fetched_data.retain(|name, data| emitted.get(name) != Some(&*data));
    for (name, data) in fetched_data.iter() {
        emitted.insert(name.clone(), data.clone());
    }
}

fn publish_simple_format(
    publisher: &mut mqtt::MqttPublisher,
    base_topic: &str,
    metric_name: &str,
    value: &serde_json::Value,
) {
    fn publish_recursive(publisher: &mut mqtt::MqttPublisher, topic: &str, val: &serde_json::Value) {
        let payload = match val {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    publish_recursive(publisher, &format!("{topic}/{k}"), v);
                }
                return;
            }
            serde_json::Value::Array(arr) => {
                for (i, v) in arr.iter().enumerate() {
                    publish_recursive(publisher, &format!("{topic}/{i}"), v);
                }
                return;
            }
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            // Do not publish null values
            serde_json::Value::Null => return,
        };
        if let Err(e) = publisher.publish(topic, &payload) {
            error!("Failed to publish message to topic {topic}: {e}");
        }
    }
    let root_topic = format!("{base_topic}/{metric_name}");
    publish_recursive(publisher, &root_topic, value);
}

fn publish_json(publisher: &mut mqtt::MqttPublisher, fetched_data: &HashMap<String, FetchedData>) {
    let mut data_to_publish = serde_json::Map::new();
    data_to_publish.insert(
        "timestamp".to_string(),
        json!(chrono::Utc::now().to_rfc3339()),
    );
    for (name, data) in fetched_data {
        match data.to_json_value() {
            Ok(val) => {
                data_to_publish.insert(name.clone(), val);
            }
            Err(e) => error!("Failed to serialize '{name}': {e}"),
        }
    }

    match serde_json::to_string(&data_to_publish) {
        Ok(json_payload) => {
            let topic = publisher.topic().to_string();
            if let Err(e) = publisher.publish(&topic, &json_payload) {
                error!("Failed to publish data to MQTT: {e:?}");
            } else {
                info!("Successfully published data to MQTT.");
            }
        }
        Err(e) => error!("Failed to serialize data to JSON string: {e}"),
    }
}

pub fn run(
    mut bms: SerialJbdBms,
    output: commandline::DaemonOutput,
    interval: std::time::Duration,
    metrics_to_fetch: Vec<String>,
) -> Result<()> {
    info!(
        "Starting daemon mode: output={output:?}, interval={interval:?}, metrics={metrics_to_fetch:?}"
    );
    let available_metrics = get_metrics();

    let mut metrics_to_process = metrics_to_fetch;
    if metrics_to_process.iter().any(|m| m == "all") {
        info!("Fetching all metrics due to 'all' flag.");
        metrics_to_process = available_metrics.keys().map(|s| s.to_string()).collect();
    }
    if let Some(unknown) = metrics_to_process
        .iter()
        .find(|m| !available_metrics.contains_key(m.as_str()))
    {
        bail!("Unknown metric name '{}'", unknown);
    }

    let mut mqtt_publisher: Option<mqtt::MqttPublisher> = None;
    if let commandline::DaemonOutput::Mqtt { config_file, .. } = &output {
        let config = mqtt::MqttConfig::load(config_file)
            .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
        info!("Successfully loaded MQTT config from {config_file}: {config:?}");
        let publisher =
            mqtt::MqttPublisher::new(config).with_context(|| "Failed to create MQTT publisher")?;
        info!("MQTT Publisher created successfully.");
        mqtt_publisher = Some(publisher);
    }

    let mut emitted: HashMap<String, FetchedData> = HashMap::new();
    loop {
        let mut fetched_data: HashMap<String, FetchedData> = HashMap::new();
        for metric_name in &metrics_to_process {
            if let Some(fetch) = available_metrics.get(metric_name.as_str()) {
                info!("Fetching metric: {metric_name}");
                match fetch(&mut bms) {
                    Ok(data) => {
                        fetched_data.insert(metric_name.to_string(), data);
                    }
                    Err(e) => error!("Error fetching metric '{metric_name}': {e}"),
                }
            }
        }
        retain_changed(&mut fetched_data, &mut emitted);

        if fetched_data.is_empty() {
            info!("No changed data in this cycle.");
        } else {
            match &output {
                commandline::DaemonOutput::Console => {
                    println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                    for (name, data) in &fetched_data {
                        println!("{}: {}", name, data.as_debug_string());
                    }
                    println!("--------------------------");
                }
                commandline::DaemonOutput::Mqtt { format, .. } => {
                    if let Some(publisher) = mqtt_publisher.as_mut() {
                        match format {
                            commandline::MqttFormat::Json => publish_json(publisher, &fetched_data),
                            commandline::MqttFormat::Simple => {
                                let base_topic = publisher.topic().to_string();
                                for (name, data) in &fetched_data {
                                    match data.to_json_value() {
                                        Ok(value) => publish_simple_format(
                                            publisher,
                                            &base_topic,
                                            name,
                                            &value,
                                        ),
                                        Err(e) => error!("Failed to serialize '{name}': {e}"),
                                    }
                                }
                            }
                        }
                    } else {
                        warn!(
                            "MQTT output selected, but publisher is not initialized. Skipping publish."
                        );
                    }
                }
            }
        }
        std::thread::sleep(interval);
    }
}
