use std::sync::Arc;

use cadenza_graph::{NodeIo, PortFlags, PortSpec, ProcessContext, ProcessError, Processable};

use super::{OnePole, SMOOTHING_MS};
use crate::model::ChannelSend;
use crate::runtime::SendRuntime;

pub const IN_L: usize = 0;
pub const IN_R: usize = 1;
pub const AMOUNT: usize = 2;
pub const OUT_L: usize = 3;
pub const OUT_R: usize = 4;

/// Copies a channel tap to another channel or a sidechain input, scaled by
/// the send amount.
pub struct SendNode {
    name: String,
    send: Arc<SendRuntime>,
    amount: OnePole,
}

impl SendNode {
    pub fn new(name: impl Into<String>, send: Arc<SendRuntime>) -> Self {
        Self {
            name: name.into(),
            send,
            amount: OnePole::new(48_000, SMOOTHING_MS),
        }
    }

    pub fn port_specs() -> Vec<PortSpec> {
        vec![
            PortSpec::audio_in("in L"),
            PortSpec::audio_in("in R"),
            PortSpec::control("amount", ChannelSend::amount_range()).with_flags(PortFlags::automatable()),
            PortSpec::audio_out("out L"),
            PortSpec::audio_out("out R"),
        ]
    }
}

impl Processable for SendNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> Vec<PortSpec> {
        Self::port_specs()
    }

    fn prepare(&mut self, sample_rate: u32, _max_block: usize) {
        self.amount.set_time_ms(sample_rate, SMOOTHING_MS);
        self.amount.reset(self.send.amount.get());
    }

    fn process(&mut self, _ctx: &ProcessContext<'_>, io: &mut NodeIo<'_>) -> Result<(), ProcessError> {
        let target = if self.send.is_enabled() {
            io.control(AMOUNT)
        } else {
            0.0
        };
        let mut last = self.amount;
        for (input, output) in [(IN_L, OUT_L), (IN_R, OUT_R)] {
            let mut amount = self.amount;
            let (src, dst) = io.samples_pair(input, output);
            for (out, sample) in dst.iter_mut().zip(src) {
                *out = sample * amount.next(target);
            }
            last = amount;
        }
        self.amount = last;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{SendId, TrackId};
    use crate::model::SendTarget;
    use crate::processors::testing::{ports_for, run};
    use cadenza_graph::{DeviceBuffers, TransportView};

    fn node(enabled: bool, amount: f32) -> SendNode {
        let mut send = ChannelSend::new(SendId(0), SendTarget::Track(TrackId(0)));
        send.enabled = enabled;
        send.amount = amount;
        let mut node = SendNode::new("send", Arc::new(SendRuntime::new(&send)));
        node.prepare(48_000, 32);
        node
    }

    #[test]
    fn scales_both_sides_by_the_amount() {
        let mut node = node(true, 0.5);
        let mut ports = ports_for(&node, 32);
        ports[IN_L].samples_mut().fill(1.0);
        ports[IN_R].samples_mut().fill(-1.0);
        ports[AMOUNT].set_control(0.5);
        run(&mut node, &mut ports, 32, TransportView::default(), &DeviceBuffers::new(0, 32, 8));
        assert!(ports[OUT_L].samples().iter().all(|s| (s - 0.5).abs() < 1e-5));
        assert!(ports[OUT_R].samples().iter().all(|s| (s + 0.5).abs() < 1e-5));
    }

    #[test]
    fn disabled_send_fades_out() {
        let mut node = node(false, 1.0);
        let mut ports = ports_for(&node, 2048);
        ports[IN_L].samples_mut().fill(1.0);
        ports[AMOUNT].set_control(1.0);
        run(&mut node, &mut ports, 2048, TransportView::default(), &DeviceBuffers::new(0, 2048, 8));
        assert!(ports[OUT_L].samples()[2047].abs() < 1e-3);
    }
}
