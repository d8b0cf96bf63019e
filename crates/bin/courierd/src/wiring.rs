//! Bus construction from configuration.

use tracing::info;

use courier_adapter_amqp_lapin::{AmqpConfig, LapinBroker};
use courier_app::correlation;
use courier_app::ports::{Handler, handler_fn};
use courier_app::{
    AnyEventBus, BusError, BusRegistry, DualWriteEventBus, DurableBusConfig, DurableEventBus,
    InProcessEventBus,
};

use crate::config::{BusMode, Config};

pub type DaemonBus = AnyEventBus<LapinBroker>;

/// Registry that builds the configured bus on first use.
pub fn registry(config: &Config) -> BusRegistry<DaemonBus> {
    let mode = config.bus.mode;
    let amqp = config.amqp.clone();
    let durable = config.durable.clone();
    BusRegistry::new(move || build(mode, amqp.clone(), durable.clone()))
}

async fn build(
    mode: BusMode,
    amqp: AmqpConfig,
    durable: DurableBusConfig,
) -> Result<DaemonBus, BusError> {
    match mode {
        BusMode::InProcess => Ok(AnyEventBus::InProcess(InProcessEventBus::new())),
        BusMode::Durable => {
            let bus = DurableEventBus::connect(LapinBroker::new(amqp), durable).await?;
            Ok(AnyEventBus::Durable(bus))
        }
        BusMode::Dual => {
            let bus = DurableEventBus::connect(LapinBroker::new(amqp), durable).await?;
            Ok(AnyEventBus::DualWrite(DualWriteEventBus::new(
                InProcessEventBus::new(),
                bus,
            )))
        }
    }
}

/// Handler that logs every event it sees.
pub fn tap() -> Handler {
    handler_fn(|event| async move {
        info!(
            event_id = event.id(),
            event_type = event.event_type(),
            source = event.metadata().source(),
            correlation_id = correlation::current().as_deref(),
            payload = %event.payload(),
            "event"
        );
        Ok(())
    })
}
