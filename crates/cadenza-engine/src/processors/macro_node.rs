use cadenza_graph::{NodeIo, PortFlags, PortRange, PortSpec, ProcessContext, ProcessError, Processable};

pub const CV_IN: usize = 0;
pub const VALUE: usize = 1;
pub const CV_OUT: usize = 2;

/// One macro knob of a modulator track. Modulators feed the CV input; the
/// CV output carries the macro value plus their sum, kept inside `[0, 1]`.
pub struct MacroNode {
    name: String,
}

impl MacroNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn port_specs() -> Vec<PortSpec> {
        vec![
            PortSpec::cv_in("modulation"),
            PortSpec::control("macro", PortRange::unit()).with_flags(PortFlags::automatable()),
            PortSpec::cv_out("cv out"),
        ]
    }
}

impl Processable for MacroNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> Vec<PortSpec> {
        Self::port_specs()
    }

    fn process(&mut self, _ctx: &ProcessContext<'_>, io: &mut NodeIo<'_>) -> Result<(), ProcessError> {
        let base = io.control(VALUE);
        let (modulation, out) = io.samples_pair(CV_IN, CV_OUT);
        for (out, cv) in out.iter_mut().zip(modulation) {
            *out = (base + cv).clamp(0.0, 1.0);
        }
        Ok(())
    }
}
