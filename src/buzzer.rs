//! Buzzer playback. OUT 0x32 blocks the interpreter for the configured
//! duration, matching the original `Beep()` call's suspension semantics.

use std::time::Duration;

use rodio::source::{SineWave, Source};
use rodio::{OutputStream, Sink};

pub fn play_tone(freq_hz: u32, duration_ms: u32) {
    let (_stream, handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(err) => {
            log::warn!("buzzer unavailable, no default audio output: {err}");
            return;
        }
    };
    let sink = match Sink::try_new(&handle) {
        Ok(sink) => sink,
        Err(err) => {
            log::warn!("buzzer unavailable, couldn't build audio sink: {err}");
            return;
        }
    };
    let tone = SineWave::new(freq_hz as f32)
        .take_duration(Duration::from_millis(duration_ms as u64))
        .amplify(0.20);
    sink.append(tone);
    sink.sleep_until_end();
}
