//! Timestep respacing
//!
//! Selects a subset of the training timesteps to sample with. Two respacing
//! formats are accepted:
//!
//! - `"ddimN"`: evenly strided steps `0, s, 2s, …` with the stride `s` chosen
//!   so exactly `N` steps result;
//! - `"a,b,c"`: the schedule is split into as many equal sections as there
//!   are counts, and each section is sampled evenly with its count.

use std::collections::BTreeSet;

use crate::config::ConfigError;

/// Training timestep indices to keep, sorted ascending.
pub fn space_timesteps(num_timesteps: usize, spec: &str) -> Result<Vec<usize>, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidRespacing {
        spec: spec.to_string(),
        reason,
    };
    let spec_trimmed = spec.trim();
    if num_timesteps == 0 {
        return Err(invalid("the base schedule has no timesteps".to_string()));
    }

    if let Some(count) = spec_trimmed.strip_prefix("ddim") {
        let desired: usize = count
            .parse()
            .map_err(|_| invalid(format!("'{count}' is not a step count")))?;
        for stride in 1..num_timesteps {
            if (0..num_timesteps).step_by(stride).count() == desired {
                return Ok((0..num_timesteps).step_by(stride).collect());
            }
        }
        // A single-step schedule has no stride in 1..num_timesteps.
        if desired == num_timesteps {
            return Ok((0..num_timesteps).collect());
        }
        return Err(invalid(format!(
            "cannot create exactly {desired} steps with an integer stride over {num_timesteps}"
        )));
    }

    let section_counts = spec_trimmed
        .split(',')
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|_| invalid(format!("'{s}' is not a step count")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let sections = section_counts.len();
    let size_per = num_timesteps / sections;
    let extra = num_timesteps % sections;
    let mut start = 0;
    let mut kept = BTreeSet::new();
    for (i, &count) in section_counts.iter().enumerate() {
        let size = size_per + usize::from(i < extra);
        if size < count {
            return Err(invalid(format!(
                "cannot divide a section of {size} steps into {count}"
            )));
        }
        if count == 0 {
            start += size;
            continue;
        }
        let frac_stride = if count <= 1 {
            1.0
        } else {
            (size - 1) as f64 / (count - 1) as f64
        };
        let mut cur = 0.0f64;
        for _ in 0..count {
            kept.insert(start + cur.round_ties_even() as usize);
            cur += frac_stride;
        }
        start += size;
    }
    Ok(kept.into_iter().collect())
}

/// Betas of the respaced process: `1 − ᾱ_i / ᾱ_prev` over the kept indices.
pub fn respaced_betas(alphas_cumprod: &[f64], use_timesteps: &[usize]) -> Vec<f64> {
    let mut last = 1.0;
    let mut betas = Vec::with_capacity(use_timesteps.len());
    for &i in use_timesteps {
        let abar = alphas_cumprod[i];
        betas.push(1.0 - abar / last);
        last = abar;
    }
    betas
}
