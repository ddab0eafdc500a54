#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use cadenza_graph::{
    MidiEvent, MidiMessage, NodeIo, ProcessContext, ProcessError, Processable, PortSpec,
};
use parking_lot::Mutex;

pub type Trace = Arc<Mutex<Vec<&'static str>>>;

pub struct Source {
    pub name: &'static str,
    pub value: f32,
    pub trace: Trace,
}

impl Processable for Source {
    fn name(&self) -> &str {
        self.name
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::audio_out("out")]
    }

    fn process(&mut self, _ctx: &ProcessContext<'_>, io: &mut NodeIo<'_>) -> Result<(), ProcessError> {
        self.trace.lock().push(self.name);
        io.samples_mut(0).fill(self.value);
        Ok(())
    }
}

/// One audio input, one audio output, multiplies by `gain`.
pub struct Gain {
    pub name: &'static str,
    pub gain: f32,
    pub trace: Trace,
    pub delay: Option<Duration>,
}

impl Gain {
    pub fn new(name: &'static str, gain: f32, trace: &Trace) -> Self {
        Self {
            name,
            gain,
            trace: Arc::clone(trace),
            delay: None,
        }
    }
}

impl Processable for Gain {
    fn name(&self) -> &str {
        self.name
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::audio_in("in"), PortSpec::audio_out("out")]
    }

    fn process(&mut self, _ctx: &ProcessContext<'_>, io: &mut NodeIo<'_>) -> Result<(), ProcessError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.trace.lock().push(self.name);
        let gain = self.gain;
        let (input, output) = io.samples_pair(0, 1);
        for (o, i) in output.iter_mut().zip(input) {
            *o = i * gain;
        }
        Ok(())
    }
}

pub struct Panicker;

impl Processable for Panicker {
    fn name(&self) -> &str {
        "panicker"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::audio_in("in"), PortSpec::audio_out("out")]
    }

    fn process(&mut self, _ctx: &ProcessContext<'_>, io: &mut NodeIo<'_>) -> Result<(), ProcessError> {
        io.samples_mut(1).fill(99.0);
        panic!("plugin exploded");
    }
}

pub struct NoteSource {
    pub note: u8,
    pub frame: u32,
}

impl Processable for NoteSource {
    fn name(&self) -> &str {
        "notes"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::midi_out("out")]
    }

    fn process(&mut self, ctx: &ProcessContext<'_>, io: &mut NodeIo<'_>) -> Result<(), ProcessError> {
        if let Some(out) = io.midi_mut(0) {
            out.push(MidiEvent {
                frame: ctx.local_offset as u32 + self.frame,
                message: MidiMessage::NoteOn {
                    channel: 0,
                    note: self.note,
                    velocity: 100,
                },
            });
        }
        Ok(())
    }
}

/// Two audio inputs and a MIDI input feeding one output.
pub struct Mixer;

impl Processable for Mixer {
    fn name(&self) -> &str {
        "mixer"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::audio_in("in"),
            PortSpec::midi_in("midi"),
            PortSpec::audio_out("out"),
        ]
    }

    fn process(&mut self, _ctx: &ProcessContext<'_>, io: &mut NodeIo<'_>) -> Result<(), ProcessError> {
        let (input, output) = io.samples_pair(0, 2);
        output.copy_from_slice(input);
        Ok(())
    }
}

/// Holds its thread until `release` is set or five seconds pass.
pub struct Stall {
    pub started: Arc<AtomicBool>,
    pub release: Arc<AtomicBool>,
}

impl Processable for Stall {
    fn name(&self) -> &str {
        "stall"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::audio_out("out")]
    }

    fn process(&mut self, _ctx: &ProcessContext<'_>, _io: &mut NodeIo<'_>) -> Result<(), ProcessError> {
        self.started.store(true, Ordering::SeqCst);
        let since = Instant::now();
        while !self.release.load(Ordering::SeqCst) && since.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }
}

/// Passes audio through and records which thread ran it.
pub struct ThreadTag {
    pub ran_on: Arc<Mutex<Vec<ThreadId>>>,
}

impl Processable for ThreadTag {
    fn name(&self) -> &str {
        "thread-tag"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::audio_in("in"), PortSpec::audio_out("out")]
    }

    fn process(&mut self, _ctx: &ProcessContext<'_>, io: &mut NodeIo<'_>) -> Result<(), ProcessError> {
        self.ran_on.lock().push(std::thread::current().id());
        let (input, output) = io.samples_pair(0, 1);
        output.copy_from_slice(input);
        Ok(())
    }
}

pub fn trace() -> Trace {
    Arc::new(Mutex::new(Vec::new()))
}
