use anyhow::{Context, Result, bail};
use std::time::{Duration, Instant};
use unaudio::{CompressionMode, PlaybackState, UnAudioConfig, UnAudioEngine, UnAudioEvent};

const USAGE: &str = "usage: unaudio-play <file> [--loop] [--buffer <frames>] [--volume <0..1>]";

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let mut args = std::env::args().skip(1);
    let path = args.next().context(USAGE)?;
    let mut looping = false;
    let mut buffer_size = 256u32;
    let mut volume = 1.0f32;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--loop" => looping = true,
            "--buffer" => buffer_size = args.next().context(USAGE)?.parse()?,
            "--volume" => volume = args.next().context(USAGE)?.parse()?,
            other => bail!("unknown argument '{}'\n{}", other, USAGE),
        }
    }

    let bytes = std::fs::read(&path).with_context(|| format!("failed to read {}", path))?;

    let engine = UnAudioEngine::new();
    engine.initialize(UnAudioConfig::default().buffer_size_frames(buffer_size))?;
    log::info!(
        "Output '{}', {:.1} ms latency",
        engine.device_name().unwrap_or_default(),
        engine.current_latency_ms()
    );

    let voice = engine.load_audio(&bytes, CompressionMode::DecompressOnLoad)?;
    let info = engine.clip_info(voice)?;
    log::info!(
        "Loaded {}: {} Hz, {} ch, {:.2} s",
        path,
        info.sample_rate,
        info.channels,
        info.length_seconds
    );

    engine.set_loop(voice, looping)?;
    engine.set_volume(voice, volume)?;
    engine.play(voice)?;

    // Looping clips play for a fixed time; others until they finish.
    let limit = if looping {
        Duration::from_secs(10)
    } else {
        Duration::from_secs_f32(info.length_seconds + 1.0)
    };
    let started = Instant::now();

    loop {
        for event in engine.poll_events() {
            match event {
                UnAudioEvent::VoiceFinished { voice } => log::info!("{} finished", voice),
                UnAudioEvent::VoiceLooped { voice, wraps } => {
                    log::info!("{} looped ({}x)", voice, wraps)
                }
                UnAudioEvent::BufferUnderrun { overrun_us } => {
                    log::warn!("Buffer underrun, {} us late", overrun_us)
                }
                UnAudioEvent::DeviceChanged => {
                    log::warn!("Output device changed");
                }
                UnAudioEvent::VoiceFault { voice, code } => {
                    log::error!("{} fault {}", voice, code)
                }
            }
        }

        if engine.voice_state(voice)? == PlaybackState::Finished || started.elapsed() > limit {
            break;
        }
        log::debug!(
            "t = {:.2} s, voice at {:.2} s, peak {:.3}",
            engine.dsp_time(),
            engine.playback_time(voice)?,
            engine.peak_level()
        );
        std::thread::sleep(Duration::from_millis(50));
    }

    engine.unload_audio(voice)?;
    engine.shutdown();
    Ok(())
}
