//! Home Assistant MQTT auto-discovery
//!
//! One retained sensor config per GPU and metric, all pointing at the GPU's
//! state topic and sharing the agent's availability topic.

use serde::Serialize;
use tracing::info;

use crate::discovery::Gpu;
use crate::sink::{availability_topic, state_topic, PublishError, Publisher, AVAILABILITY_ONLINE};

/// Seconds after which HA marks a sensor unavailable without new state
const EXPIRE_AFTER_SECS: u32 = 60;

#[derive(Debug, Clone, Copy)]
pub struct SensorDescription {
    pub key: &'static str,
    pub name: &'static str,
    pub device_class: Option<&'static str>,
    pub unit: Option<&'static str>,
    /// JSON path inside the state payload
    pub value_path: &'static str,
}

const fn sensor(
    key: &'static str,
    name: &'static str,
    device_class: Option<&'static str>,
    unit: Option<&'static str>,
    value_path: &'static str,
) -> SensorDescription {
    SensorDescription {
        key,
        name,
        device_class,
        unit,
        value_path,
    }
}

pub const SENSORS: &[SensorDescription] = &[
    sensor("pwr", "Power Usage", Some("power"), Some("W"), "dmon.pwr"),
    sensor("gtemp", "GPU Temp", Some("temperature"), Some("°C"), "dmon.gtemp"),
    sensor("mtemp", "Memory Temp", Some("temperature"), Some("°C"), "dmon.mtemp"),
    sensor("sm", "SM Util", None, Some("%"), "dmon.sm"),
    sensor("mem", "Memory Util", None, Some("%"), "dmon.mem"),
    sensor("enc", "Encoder Util", None, Some("%"), "dmon.enc"),
    sensor("dec", "Decoder Util", None, Some("%"), "dmon.dec"),
    sensor("jpg", "JPG Util", None, Some("%"), "dmon.jpg"),
    sensor("ofa", "Optical Flow Util", None, Some("%"), "dmon.ofa"),
    sensor("mclk", "Memory Clock", Some("frequency"), Some("MHz"), "dmon.mclk"),
    sensor("pclk", "Processor Clock", Some("frequency"), Some("MHz"), "dmon.pclk"),
    sensor("pci", "PCI Throughput", Some("data_rate"), Some("MB/s"), "dmon.pci"),
    sensor("rxpci", "PCI RX", Some("data_rate"), Some("MB/s"), "dmon.rxpci"),
    sensor("txpci", "PCI TX", Some("data_rate"), Some("MB/s"), "dmon.txpci"),
    sensor("utilgpu", "GPU Utilization", None, Some("%"), "query.utilgpu"),
    sensor("memused", "Memory Used", Some("data_size"), Some("MiB"), "query.memused"),
    sensor("memfree", "Memory Free", Some("data_size"), Some("MiB"), "query.memfree"),
    sensor("drivver", "Driver Version", None, None, "query.drivver"),
    sensor("fanspe", "Fan Speed", None, Some("%"), "query.fanspe"),
    sensor("pstat", "Power State", None, None, "query.pstat"),
];

/// HA device block: one device per GPU
#[derive(Debug, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub identifiers: Vec<String>,
    pub manufacturer: String,
    pub model: String,
}

#[derive(Debug, Serialize)]
pub struct ConfigPayload {
    pub device: DeviceInfo,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    pub value_template: String,
    pub unique_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    pub expire_after: u32,
    pub enabled_by_default: bool,
    pub availability_topic: String,
    pub state_topic: String,
}

pub fn config_topic(gpu: &Gpu, sensor: &SensorDescription) -> String {
    format!("homeassistant/sensor/{}_{}/config", gpu.uuid, sensor.key)
}

pub fn config_payload(gpu: &Gpu, sensor: &SensorDescription, base_topic: &str) -> ConfigPayload {
    ConfigPayload {
        device: DeviceInfo {
            name: gpu.name.clone(),
            identifiers: vec![gpu.uuid.clone()],
            manufacturer: "NVIDIA".to_string(),
            model: gpu.name.clone(),
        },
        name: sensor.name.to_string(),
        device_class: sensor.device_class.map(str::to_string),
        unit_of_measurement: sensor.unit.map(str::to_string),
        value_template: format!("{{{{ value_json.{} }}}}", sensor.value_path),
        unique_id: format!("{}_{}", gpu.uuid, sensor.key),
        // text sensors have no measurement semantics
        state_class: sensor.unit.map(|_| "measurement".to_string()),
        expire_after: EXPIRE_AFTER_SECS,
        enabled_by_default: true,
        availability_topic: availability_topic(base_topic),
        state_topic: state_topic(base_topic, &gpu.uuid),
    }
}

/// Publish every sensor config for every GPU, then mark the agent online
pub async fn publish_configs<P: Publisher>(
    publisher: &P,
    gpus: &[Gpu],
    base_topic: &str,
) -> Result<usize, PublishError> {
    let mut published = 0;

    for gpu in gpus {
        for sensor in SENSORS {
            let payload = config_payload(gpu, sensor, base_topic);
            let body = serde_json::to_string(&payload)
                .map_err(|e| PublishError::Rejected(format!("config for {}: {}", payload.unique_id, e)))?;
            publisher.publish(body, &config_topic(gpu, sensor), true).await?;
            published += 1;
        }
    }

    publisher
        .publish(AVAILABILITY_ONLINE.to_string(), &availability_topic(base_topic), true)
        .await?;

    info!(configs = published, gpus = gpus.len(), "published home assistant discovery configs");
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{other_gpu, test_gpu, TEST_UUID};
    use symbion_devkit::MockMqttClient;

    #[test]
    fn test_sensor_table_covers_every_published_metric() {
        assert_eq!(SENSORS.len(), 20);

        let mut keys: Vec<_> = SENSORS.iter().map(|s| s.key).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), SENSORS.len());

        for sensor in SENSORS {
            let (section, field) = sensor.value_path.split_once('.').unwrap();
            assert!(section == "dmon" || section == "query");
            assert_eq!(field, sensor.key);
        }
    }

    #[test]
    fn test_config_payload_with_unit() {
        let pwr = SENSORS.iter().find(|s| s.key == "pwr").unwrap();
        let json = serde_json::to_value(config_payload(&test_gpu(), pwr, "smi2mqtt")).unwrap();

        assert_eq!(json["name"], "Power Usage");
        assert_eq!(json["device_class"], "power");
        assert_eq!(json["unit_of_measurement"], "W");
        assert_eq!(json["state_class"], "measurement");
        assert_eq!(json["value_template"], "{{ value_json.dmon.pwr }}");
        assert_eq!(json["unique_id"], format!("{}_pwr", TEST_UUID));
        assert_eq!(json["expire_after"], 60);
        assert_eq!(json["availability_topic"], "smi2mqtt/availability");
        assert_eq!(json["state_topic"], format!("smi2mqtt/{}/state", TEST_UUID));
        assert_eq!(json["device"]["identifiers"][0], TEST_UUID);
        assert_eq!(json["device"]["manufacturer"], "NVIDIA");
        assert_eq!(json["device"]["model"], "GPU-A");
    }

    #[test]
    fn test_config_payload_text_sensor() {
        let pstat = SENSORS.iter().find(|s| s.key == "pstat").unwrap();
        let json = serde_json::to_value(config_payload(&test_gpu(), pstat, "smi2mqtt")).unwrap();

        assert!(json.get("state_class").is_none());
        assert!(json.get("unit_of_measurement").is_none());
        assert!(json.get("device_class").is_none());
        assert_eq!(json["value_template"], "{{ value_json.query.pstat }}");
    }

    #[tokio::test]
    async fn test_publish_configs() {
        let client = MockMqttClient::new();
        let gpus = vec![test_gpu(), other_gpu()];

        let count = publish_configs(&client, &gpus, "smi2mqtt").await.unwrap();
        assert_eq!(count, 40);

        let messages = client.get_published_messages();
        assert_eq!(messages.len(), 41);
        assert!(messages.iter().all(|m| m.retain));

        let topic = format!("homeassistant/sensor/{}_gtemp/config", other_gpu().uuid);
        let config: serde_json::Value = client.get_last_json_message(&topic).unwrap().unwrap();
        assert_eq!(config["name"], "GPU Temp");

        let last = messages.last().unwrap();
        assert_eq!(last.topic, "smi2mqtt/availability");
        assert_eq!(last.payload, b"online");
    }

    #[tokio::test]
    async fn test_publish_configs_stops_on_failure() {
        let client = MockMqttClient::new();
        client.set_failing(true);

        let result = publish_configs(&client, &[test_gpu()], "smi2mqtt").await;
        assert!(matches!(result, Err(PublishError::Rejected(_))));
    }
}
