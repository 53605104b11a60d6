use std::io::Cursor;
use std::path::Path;
use voxnav_core::error::{Error, Result};

fn spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

fn wav_err(e: hound::Error) -> Error {
    Error::Validation(format!("WAV error: {}", e))
}

/// Encode mono PCM16 as an in-memory WAV file.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec(sample_rate)).map_err(wav_err)?;
        for &s in samples {
            writer.write_sample(s).map_err(wav_err)?;
        }
        writer.finalize().map_err(wav_err)?;
    }
    Ok(cursor.into_inner())
}

pub fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) -> Result<()> {
    let bytes = encode_wav(samples, sample_rate)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Read a 16-bit integer WAV file as mono samples plus its sample rate.
/// Multi-channel input is averaged down to one channel.
pub fn read_wav(path: &Path) -> Result<(Vec<i16>, u32)> {
    let reader = hound::WavReader::open(path).map_err(wav_err)?;
    let spec = reader.spec();
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(Error::Validation(format!(
            "{}: expected 16-bit integer PCM, got {}-bit {:?}",
            path.display(),
            spec.bits_per_sample,
            spec.sample_format
        )));
    }
    let interleaved = reader
        .into_samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(wav_err)?;

    let channels = spec.channels.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|c| (c.iter().map(|&s| s as i32).sum::<i32>() / c.len() as i32) as i16)
            .collect()
    };
    Ok((samples, spec.sample_rate))
}
