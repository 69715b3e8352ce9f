/*!
Test Harness pour l'agent GPU Symbion

Facilite l'écriture de tests avec:
- Mock MQTT partagé avec le code testé
- Attente bornée des publications
- Assertions sur les champs JSON publiés
*/

use crate::mqtt_stub::MockMqttClient;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

const POLL_STEP: Duration = Duration::from_millis(50);

/// Harness de test autour d'un MockMqttClient
pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
}

impl TestHarness {
    /// Crée un nouveau harness de test
    pub fn new() -> Self {
        Self {
            mqtt_client: MockMqttClient::new(),
        }
    }

    /// Attend qu'au moins `count` messages soient publiés sur un topic
    ///
    /// Utilise l'horloge tokio: compatible avec les tests en temps suspendu.
    pub async fn wait_for_messages(&self, topic: &str, count: usize, timeout: Duration) -> Result<Vec<Value>> {
        let deadline = Instant::now() + timeout;

        loop {
            let messages = self.mqtt_client.find_messages_by_topic(topic);
            if messages.len() >= count {
                log::info!("✅ Received {} messages on {}", messages.len(), topic);
                return messages
                    .iter()
                    .map(|msg| serde_json::from_slice(&msg.payload).map_err(Into::into))
                    .collect();
            }
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "Timeout waiting for {} messages on '{}': got {}",
                    count,
                    topic,
                    messages.len()
                );
            }
            tokio::time::sleep(POLL_STEP).await;
        }
    }

    /// Assert qu'un champ a une valeur spécifique dans le dernier message
    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        if let Some(msg) = self.mqtt_client.get_last_json_message::<Value>(topic)? {
            if let Some(actual) = get_nested_field(&msg, field_path) {
                if actual == expected {
                    log::info!("✅ Field '{}' = {:?} in {}", field_path, expected, topic);
                    return Ok(());
                }
                anyhow::bail!("Field '{}' mismatch: expected {:?}, got {:?}", field_path, expected, actual);
            }
        }

        anyhow::bail!("Field '{}' not found for comparison in {}", field_path, topic);
    }

    /// Nombre de messages par topic
    pub fn topic_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for msg in self.mqtt_client.get_published_messages() {
            *counts.entry(msg.topic).or_insert(0) += 1;
        }
        counts
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Suit un chemin `a.b.c` dans un objet JSON
pub fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(obj) => obj.get(part),
        _ => None,
    })
}
