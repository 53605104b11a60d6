/// Level reported for digital silence.
pub const SILENCE_FLOOR_DB: f32 = -96.0;

/// Root-mean-square amplitude of a PCM16 frame, normalised to [0, 1].
pub fn rms(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f64 = frame
        .iter()
        .map(|&s| {
            let v = s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    (sum / frame.len() as f64).sqrt() as f32
}

/// RMS level in dBFS, clamped at [`SILENCE_FLOOR_DB`].
pub fn rms_dbfs(frame: &[i16]) -> f32 {
    let r = rms(frame);
    if r <= 0.0 {
        return SILENCE_FLOOR_DB;
    }
    (20.0 * r.log10()).max(SILENCE_FLOOR_DB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_floor() {
        assert_eq!(rms(&[0; 320]), 0.0);
        assert_eq!(rms_dbfs(&[0; 320]), SILENCE_FLOOR_DB);
        assert_eq!(rms_dbfs(&[]), SILENCE_FLOOR_DB);
    }

    #[test]
    fn test_full_scale_is_zero_db() {
        let frame = vec![i16::MAX; 320];
        assert!((rms(&frame) - 1.0).abs() < 1e-6);
        assert!(rms_dbfs(&frame).abs() < 0.01);
    }

    #[test]
    fn test_half_scale_is_about_minus_six() {
        let frame = vec![i16::MAX / 2; 320];
        let db = rms_dbfs(&frame);
        assert!((db + 6.02).abs() < 0.1, "got {}", db);
    }
}
