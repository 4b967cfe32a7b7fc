use super::types::BusConfig;
use crate::error::BusError;
use crate::transport::Transport;

impl BusConfig {
    /// Validate the config: endpoint syntax, timeouts and name clashes.
    pub fn validate(&self) -> Result<(), BusError> {
        Transport::parse(&self.bus.endpoint)
            .map_err(|e| BusError::Config(format!("bus.endpoint: {e}")))?;
        self.validate_timeouts()?;
        self.validate_names()?;
        Ok(())
    }

    fn validate_timeouts(&self) -> Result<(), BusError> {
        if self.bus.command_timeout_secs == 0 {
            return Err(BusError::Config(
                "bus.command_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.bus.ephemeral_idle_secs == 0 {
            return Err(BusError::Config(
                "bus.ephemeral_idle_secs must be greater than zero".into(),
            ));
        }
        for (name, svc) in &self.services {
            if svc.timeout_secs == 0 {
                return Err(BusError::Config(format!(
                    "services.{name}.timeout_secs must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    /// A name cannot be both a queue and an exchange.
    fn validate_names(&self) -> Result<(), BusError> {
        let queues = self
            .bus
            .queues
            .iter()
            .cloned()
            .chain(self.services.keys().map(|name| self.service_queue(name)));
        for queue in queues {
            if queue.trim().is_empty() {
                return Err(BusError::Config("empty queue name".into()));
            }
            if self.bus.exchanges.contains(&queue) {
                return Err(BusError::Config(format!(
                    "'{queue}' is declared both as a queue and as an exchange"
                )));
            }
        }
        if self.bus.exchanges.iter().any(|e| e.trim().is_empty()) {
            return Err(BusError::Config("empty exchange name".into()));
        }
        Ok(())
    }
}
