/*!
Mock MQTT Client pour développement sans broker

Enregistre tous les messages publiés pour les assertions de tests et peut
simuler un broker qui rejette les publications.
*/

use anyhow::Result;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock MQTT Client qui simule rumqttc::AsyncClient
#[derive(Clone)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    failing: Arc<AtomicBool>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simule un broker indisponible: les publications échouent sans être enregistrées
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Simule la publication d'un message (compatible avec AsyncClient)
    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let topic = topic.into();
        if self.failing.load(Ordering::SeqCst) {
            log::warn!("❌ [MOCK] Rejected publish to {}", topic);
            anyhow::bail!("mock broker rejected publish to {}", topic);
        }

        let message = MockMessage {
            topic,
            payload: payload.into(),
            qos,
            retain,
        };

        log::info!("📤 [MOCK] Published to {}: {} bytes", message.topic, message.payload.len());
        self.published_messages.lock().unwrap().push(message);
        Ok(())
    }

    /// Récupère tous les messages publiés (pour assertions de tests)
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    /// Trouve les messages publiés sur un topic donné
    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse le dernier message d'un topic en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        if let Some(last_msg) = messages.last() {
            let parsed: T = serde_json::from_slice(&last_msg.payload)?;
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }

    /// Reset tous les messages enregistrés
    pub fn clear(&self) {
        self.published_messages.lock().unwrap().clear();
    }
}

impl Default for MockMqttClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_client_publish() {
        let client = MockMqttClient::new();

        let payload = b"online";
        client.publish("smi2mqtt/availability", QoS::AtMostOnce, true, payload.to_vec()).await.unwrap();

        let messages = client.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "smi2mqtt/availability");
        assert_eq!(messages[0].payload, payload);
        assert!(messages[0].retain);
    }

    #[tokio::test]
    async fn test_json_message_parsing() {
        let client = MockMqttClient::new();

        let state = serde_json::json!({"dmon": {"pwr": 42}});
        client.publish("gpu/state", QoS::AtMostOnce, false, serde_json::to_vec(&state).unwrap()).await.unwrap();

        let parsed: Option<serde_json::Value> = client.get_last_json_message("gpu/state").unwrap();
        assert_eq!(parsed.unwrap()["dmon"]["pwr"], 42);
        assert!(client.get_last_json_message::<serde_json::Value>("other").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_client_records_nothing() {
        let client = MockMqttClient::new();
        client.set_failing(true);

        assert!(client.publish("gpu/state", QoS::AtMostOnce, false, "x").await.is_err());
        assert!(client.get_published_messages().is_empty());

        client.set_failing(false);
        client.publish("gpu/state", QoS::AtMostOnce, false, "x").await.unwrap();
        assert_eq!(client.find_messages_by_topic("gpu/state").len(), 1);

        client.clear();
        assert!(client.get_published_messages().is_empty());
    }
}
