//! MQTT topic scheme.
//!
//! ```text
//! <prefix>/device/<address>/reading      QoS 1, retain=false
//! <prefix>/device/<address>/status       QoS 1, retain=true
//! <prefix>/vehicle/<id>/summary          QoS 1, retain=true
//! <prefix>/system/status                 QoS 2, retain=true
//! <prefix>/discovery/found               QoS 1, retain=false
//! ```

use super::QosLevel;

/// Topic builder bound to one prefix.
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn device_reading(&self, address: &str) -> String {
        format!("{}/device/{}/reading", self.prefix, address)
    }

    pub fn device_status(&self, address: &str) -> String {
        format!("{}/device/{}/status", self.prefix, address)
    }

    pub fn vehicle_summary(&self, vehicle_id: &str) -> String {
        format!("{}/vehicle/{}/summary", self.prefix, vehicle_id)
    }

    pub fn system_status(&self) -> String {
        format!("{}/system/status", self.prefix)
    }

    pub fn discovery_found(&self) -> String {
        format!("{}/discovery/found", self.prefix)
    }

    /// (QoS, retain) for a topic produced by this scheme.
    pub fn delivery(&self, topic: &str) -> (QosLevel, bool) {
        let suffix = topic.strip_prefix(&self.prefix).unwrap_or(topic);
        if suffix.starts_with("/system/") {
            (QosLevel::ExactlyOnce, true)
        } else if suffix.ends_with("/status") || suffix.ends_with("/summary") {
            (QosLevel::AtLeastOnce, true)
        } else {
            (QosLevel::AtLeastOnce, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_shapes() {
        let topics = Topics::new("batwatch");
        assert_eq!(
            topics.device_reading("AA:BB:CC:DD:EE:FF"),
            "batwatch/device/AA:BB:CC:DD:EE:FF/reading"
        );
        assert_eq!(
            topics.device_status("AA:BB:CC:DD:EE:FF"),
            "batwatch/device/AA:BB:CC:DD:EE:FF/status"
        );
        assert_eq!(topics.vehicle_summary("van"), "batwatch/vehicle/van/summary");
        assert_eq!(topics.system_status(), "batwatch/system/status");
        assert_eq!(topics.discovery_found(), "batwatch/discovery/found");
    }

    #[test]
    fn delivery_classes() {
        let topics = Topics::new("batwatch");
        let (qos, retain) = topics.delivery(&topics.device_reading("X"));
        assert_eq!((qos, retain), (QosLevel::AtLeastOnce, false));

        let (qos, retain) = topics.delivery(&topics.device_status("X"));
        assert_eq!((qos, retain), (QosLevel::AtLeastOnce, true));

        let (qos, retain) = topics.delivery(&topics.vehicle_summary("v"));
        assert_eq!((qos, retain), (QosLevel::AtLeastOnce, true));

        let (qos, retain) = topics.delivery(&topics.system_status());
        assert_eq!((qos, retain), (QosLevel::ExactlyOnce, true));

        let (qos, retain) = topics.delivery(&topics.discovery_found());
        assert_eq!((qos, retain), (QosLevel::AtLeastOnce, false));
    }

    #[test]
    fn trailing_slash_in_prefix_is_trimmed() {
        let topics = Topics::new("fleet/");
        assert_eq!(topics.system_status(), "fleet/system/status");
    }
}
