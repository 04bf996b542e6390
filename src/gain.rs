// src/gain.rs

/// Output over input, clamped to 0 when the input reads zero.
pub fn ratio(output: f64, input: f64) -> f64 {
    if input != 0.0 {
        output / input
    } else {
        0.0
    }
}

/// Gain in decibels. Non-positive gains map to negative infinity.
pub fn to_db(gain: f64) -> f64 {
    if gain > 0.0 {
        20.0 * gain.log10()
    } else {
        f64::NEG_INFINITY
    }
}

/// The four scope readings taken at one frequency.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelReadings {
    pub input_pk2pk: f64,
    pub input_amplitude: f64,
    pub output_pk2pk: f64,
    pub output_amplitude: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Gains {
    pub pk2pk: f64,
    pub amplitude: f64,
    /// Mean of the two ratios.
    pub real: f64,
}

impl ChannelReadings {
    /// Gain needs a non-zero peak-to-peak reading on both channels.
    pub fn has_signal(&self) -> bool {
        self.input_pk2pk != 0.0 && self.output_pk2pk != 0.0
    }

    pub fn gains(&self) -> Gains {
        let pk2pk = ratio(self.output_pk2pk, self.input_pk2pk);
        let amplitude = ratio(self.output_amplitude, self.input_amplitude);
        Gains {
            pk2pk,
            amplitude,
            real: (pk2pk + amplitude) / 2.0,
        }
    }
}
