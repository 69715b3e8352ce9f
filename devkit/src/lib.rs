/*!
# Symbion DevKit - Stubs et Utilitaires pour Développement

Bibliothèque facilitant le test de l'agent GPU Symbion avec:
- Stub MQTT pour tests sans broker
- Lignes nvidia-smi synthétiques (`dmon`, `--query-gpu`, listing)
- Harness d'attente et d'assertions sur les messages publiés
*/

pub mod fixtures;
pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockMessage, MockMqttClient};
pub use test_utils::TestHarness;
