//! Coaddition of exposures into the template.
//!
//! Every policy starts from the same alignment pass: each usable exposure
//! is fitted order by order against the current template and the order
//! velocities are combined into one pre-RV per exposure. The policies
//! differ in how the rest-shifted, continuum-normalized pixels are merged:
//!
//! * `flying`: running inverse-variance accumulation onto the seed grid,
//!   the template is rebuilt after every exposure.
//! * `post`: buffered accumulation, one weighted average at the end,
//!   Savitzky-Golay smoothed.
//! * `post3` (default): one B-spline least-squares fit per order over the
//!   pixels of all exposures at once, with asymmetric kappa-sigma clipping
//!   against a local noise estimate. Telluric pixels keep a small weight
//!   and are never clipped, so the template stays defined under the bands.

use serde::Serialize;

use crate::common::config::RunConfig;
use crate::common::constants::TEMPLATE_OVERSAMPLING;
use crate::domain::CoaddPolicy;
use crate::fit::model::continuum;
use crate::fit::{fit_order, FitMode, OrderFit, OrderFitInput};
use crate::numerics::bspline::{self, basis_weights, BSplineFit, BSplineFitConfig};
use crate::numerics::savgol::savgol_smooth;
use crate::numerics::spline::CubicSpline;
use crate::numerics::{
    inverse_variance_mean, interpolate_linear, median_inplace, stable_weighted_mean, std_dev,
    weighted_rms,
};
use crate::spectrum::{Exposure, PixelFlags, SpectralOrder, WaveScale, WavelengthMask};

use super::{
    order_quality, seed_order, select_reference, KnotDiagnostics, OrderTemplate, SeedOrder,
    Template, TemplateError,
};

/// Native pixels per B-spline knot at `knot_factor` 1.
const NATIVE_PIXELS_PER_KNOT: f64 = 4.0;
/// Coarse noise series resolution, template knots per noise knot.
const LOCAL_NOISE_KNOT_DIVISOR: usize = 5;
/// Savitzky-Golay window and order of the `post` smoothing.
const POST_SMOOTH_WINDOW: usize = 21;
const POST_SMOOTH_ORDER: usize = 5;
/// Minimum usable pixels before an exposure order is resampled.
const MIN_RESAMPLE_PIXELS: usize = 8;

/// Everything the coadder consumes. Masks are evaluated in the observer
/// frame of each exposure.
pub struct CoaddInput<'a> {
    pub exposures: &'a [Exposure],
    pub config: &'a RunConfig,
    pub telluric: Option<&'a WavelengthMask>,
    pub sky: Option<&'a WavelengthMask>,
}

/// Alignment velocity of one exposure against the seed, inverse-variance
/// combined over its orders. NaN when no order produced a usable fit.
#[derive(Debug, Clone, Serialize)]
pub struct PreRv {
    pub exposure_id: String,
    pub bjd: f64,
    pub velocity_kms: f64,
    pub e_velocity_mps: f64,
}

#[derive(Debug)]
pub struct CoaddOutcome {
    pub template: Template,
    pub pre_rvs: Vec<PreRv>,
}

/// Builds the template: seeds every order from the highest-S/N exposure,
/// aligns all usable exposures against it, then merges them under the
/// configured coaddition policy.
pub fn build_template(input: &CoaddInput<'_>) -> Result<CoaddOutcome, TemplateError> {
    let config = input.config;
    let scale = config.scale;
    let exposures = input.exposures;

    let reference = select_reference(exposures)?;
    let n_orders = exposures[reference].n_orders();
    for exposure in exposures.iter().filter(|e| e.is_usable()) {
        if exposure.n_orders() != n_orders {
            return Err(TemplateError::MismatchedOrders {
                id: exposure.id.clone(),
                expected: n_orders,
                found: exposure.n_orders(),
            });
        }
    }

    let mut seeds: Vec<Option<SeedOrder>> = Vec::with_capacity(n_orders);
    let mut orders = Vec::with_capacity(n_orders);
    for o in 0..n_orders {
        let order = &exposures[reference].orders[o];
        match seed_order(
            order,
            exposures[reference].berv_kms,
            scale,
            &config.pixel_window,
            input.telluric,
            input.sky,
        ) {
            Some(seed) => {
                let tpl = OrderTemplate::new(
                    seed.wavelength.clone(),
                    seed.flux.clone(),
                    order_quality(order),
                )
                .map_err(|source| TemplateError::Spline { order: o, source })?;
                orders.push(Some(tpl));
                seeds.push(Some(seed));
            }
            None => {
                orders.push(None);
                seeds.push(None);
            }
        }
    }
    let mut template = Template::new(scale, exposures[reference].id.clone(), orders);

    // Grid positions under a telluric or sky band never take resampled
    // contributions in the flying and post policies.
    let masked_grid: Vec<Vec<bool>> = seeds
        .iter()
        .map(|seed| {
            seed.as_ref()
                .map(|s| {
                    s.flags
                        .iter()
                        .map(|f| f.intersects(PixelFlags::ATM | PixelFlags::SKY))
                        .collect()
                })
                .unwrap_or_default()
        })
        .collect();

    let usable: Vec<usize> = (0..exposures.len())
        .filter(|&i| exposures[i].is_usable())
        .collect();
    let mut pre_rvs: Vec<PreRv> = exposures
        .iter()
        .map(|e| PreRv {
            exposure_id: e.id.clone(),
            bjd: e.bjd,
            velocity_kms: f64::NAN,
            e_velocity_mps: f64::NAN,
        })
        .collect();

    let mut flying = match config.coadd.policy {
        CoaddPolicy::Flying => Some(FlyingState::from_seeds(&seeds)),
        _ => None,
    };
    let mut post: Option<Vec<Vec<(Vec<f64>, Vec<f64>)>>> = match config.coadd.policy {
        CoaddPolicy::Post => Some(vec![Vec::new(); n_orders]),
        _ => None,
    };

    for &i in &usable {
        let exposure = &exposures[i];
        let mut velocities = Vec::new();
        let mut errors_kms = Vec::new();
        for o in 0..n_orders {
            let order = &exposure.orders[o];
            let fit = {
                let Some(tpl) = template.order(o) else {
                    continue;
                };
                fit_order(
                    &OrderFitInput {
                        order,
                        template: tpl.spline(),
                        scale,
                        degree: config.degree,
                        clip: config.clip,
                        grid: config.grid,
                        prior_kms: 0.0,
                        window: config.pixel_window.clamp_to(order.len()),
                        keep_surface: false,
                        line_width: false,
                    },
                    FitMode::GridSearch,
                )
            };
            if fit.velocity_kms.is_finite()
                && fit.e_velocity_mps.is_finite()
                && fit.e_velocity_mps > 0.0
            {
                velocities.push(fit.velocity_kms);
                errors_kms.push(fit.e_velocity_mps / 1000.0);
            }
            if fit.coeffs.is_empty() {
                continue;
            }
            if flying.is_some() || post.is_some() {
                let resampled = {
                    let Some(tpl) = template.order(o) else {
                        continue;
                    };
                    resample_normalized(order, &fit, scale, tpl.wavelength(), &masked_grid[o])
                };
                let Some((flux, weight)) = resampled else {
                    continue;
                };
                if let Some(state) = flying.as_mut() {
                    state.fold(o, &flux, &weight);
                    let blended = state.blended(o);
                    if let Some(tpl) = template.order_mut(o) {
                        tpl.replace_flux(blended)
                            .map_err(|source| TemplateError::Spline { order: o, source })?;
                    }
                }
                if let Some(buffers) = post.as_mut() {
                    buffers[o].push((flux, weight));
                }
            }
        }
        if let Some((v, e_kms)) = inverse_variance_mean(&velocities, &errors_kms) {
            pre_rvs[i].velocity_kms = v;
            pre_rvs[i].e_velocity_mps = e_kms * 1000.0;
        }
    }

    let contributors: Vec<usize> = usable
        .iter()
        .copied()
        .filter(|&i| pre_rvs[i].velocity_kms.is_finite())
        .collect();

    match config.coadd.policy {
        CoaddPolicy::Flying => {}
        CoaddPolicy::Post => {
            if let Some(buffers) = post {
                finish_post(&mut template, buffers)?;
            }
        }
        CoaddPolicy::Post2 => return Err(TemplateError::UnresolvedPolicy),
        CoaddPolicy::Post3 => {
            finish_post3(&mut template, exposures, &contributors, &pre_rvs, config)?;
        }
    }
    template.set_n_exposures(contributors.len().max(1));

    Ok(CoaddOutcome { template, pre_rvs })
}

/// Rest-shifts the clear pixels of one exposure order, divides out the
/// fitted continuum and resamples flux and inverse-variance weights onto
/// the template grid. Masked grid positions and positions outside the
/// pixel coverage get zero weight.
fn resample_normalized(
    order: &SpectralOrder,
    fit: &OrderFit,
    scale: WaveScale,
    grid: &[f64],
    masked: &[bool],
) -> Option<(Vec<f64>, Vec<f64>)> {
    let poly = continuum(&fit.coeffs, fit.wavelength_center, order.wavelength());
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    let mut es = Vec::new();
    for i in 0..order.len() {
        if !order.flags()[i].is_clear() {
            continue;
        }
        let e = order.error()[i];
        let f = order.flux()[i];
        if !(e > 0.0) || !e.is_finite() || !f.is_finite() || !(poly[i] > 0.0) {
            continue;
        }
        xs.push(scale.to_rest_frame(order.wavelength()[i], fit.velocity_kms));
        ys.push(f / poly[i]);
        es.push(e / poly[i]);
    }
    if xs.len() < MIN_RESAMPLE_PIXELS {
        return None;
    }
    let resampler = CubicSpline::natural(xs.clone(), ys).ok()?;

    let lo = xs[0];
    let hi = xs[xs.len() - 1];
    let mut flux = vec![0.0; grid.len()];
    let mut weight = vec![0.0; grid.len()];
    for (g, &wg) in grid.iter().enumerate() {
        if masked.get(g).copied().unwrap_or(false) || wg < lo || wg > hi {
            continue;
        }
        let Some(e) = interpolate_linear(wg, &xs, &es) else {
            continue;
        };
        if !(e > 0.0) || !e.is_finite() {
            continue;
        }
        flux[g] = resampler.eval(wg);
        weight[g] = 1.0 / (e * e);
    }
    Some((flux, weight))
}

/// Running accumulator of the flying policy, one slot per template order.
/// The seed enters with its own inverse-variance weight; grid positions
/// nothing accumulated onto fall back to the seed flux.
struct FlyingState {
    acc: Vec<Vec<f64>>,
    wsum: Vec<Vec<f64>>,
    fallback: Vec<Vec<f64>>,
}

impl FlyingState {
    fn from_seeds(seeds: &[Option<SeedOrder>]) -> Self {
        let mut acc = Vec::with_capacity(seeds.len());
        let mut wsum = Vec::with_capacity(seeds.len());
        let mut fallback = Vec::with_capacity(seeds.len());
        for seed in seeds {
            match seed {
                Some(s) => {
                    let n = s.wavelength.len();
                    let mut a = vec![0.0; n];
                    let mut w = vec![0.0; n];
                    for g in 0..n {
                        if s.flags[g].is_clear() && s.error[g] > 0.0 && s.error[g].is_finite() {
                            let wg = 1.0 / (s.error[g] * s.error[g]);
                            a[g] = s.flux[g] * wg;
                            w[g] = wg;
                        }
                    }
                    acc.push(a);
                    wsum.push(w);
                    fallback.push(s.flux.clone());
                }
                None => {
                    acc.push(Vec::new());
                    wsum.push(Vec::new());
                    fallback.push(Vec::new());
                }
            }
        }
        Self { acc, wsum, fallback }
    }

    fn fold(&mut self, o: usize, flux: &[f64], weight: &[f64]) {
        let acc = &mut self.acc[o];
        let wsum = &mut self.wsum[o];
        for g in 0..acc.len().min(flux.len()) {
            acc[g] += weight[g] * flux[g];
            wsum[g] += weight[g];
        }
    }

    fn blended(&self, o: usize) -> Vec<f64> {
        self.acc[o]
            .iter()
            .zip(&self.wsum[o])
            .zip(&self.fallback[o])
            .map(|((&a, &w), &seed)| if w > 0.0 { a / w } else { seed })
            .collect()
    }
}

/// Weighted average of the buffered resamples, Savitzky-Golay smoothed.
/// Grid positions no exposure reached keep the seed flux.
fn finish_post(
    template: &mut Template,
    buffers: Vec<Vec<(Vec<f64>, Vec<f64>)>>,
) -> Result<(), TemplateError> {
    for (o, stack) in buffers.into_iter().enumerate() {
        if stack.is_empty() {
            continue;
        }
        let mut flux = {
            let Some(tpl) = template.order(o) else {
                continue;
            };
            tpl.flux().to_vec()
        };
        for (g, value) in flux.iter_mut().enumerate() {
            let mut num = 0.0;
            let mut den = 0.0;
            for (f, w) in &stack {
                num += w[g] * f[g];
                den += w[g];
            }
            if den > 0.0 {
                *value = num / den;
            }
        }
        if flux.len() >= POST_SMOOTH_WINDOW {
            if let Ok(smoothed) = savgol_smooth(&flux, POST_SMOOTH_WINDOW, POST_SMOOTH_ORDER) {
                flux = smoothed;
            }
        }
        if let Some(tpl) = template.order_mut(o) {
            tpl.replace_flux(flux)
                .map_err(|source| TemplateError::Spline { order: o, source })?;
        }
    }
    Ok(())
}

/// The B-spline coadd. Per order: rest-shift and normalize the pixels of
/// every contributing exposure, then iterate fit / local noise / clip and
/// replace the template flux by the fitted curve inside the covered range.
fn finish_post3(
    template: &mut Template,
    exposures: &[Exposure],
    contributors: &[usize],
    pre_rvs: &[PreRv],
    config: &RunConfig,
) -> Result<(), TemplateError> {
    let scale = config.scale;
    let coadd = &config.coadd;

    for o in 0..template.n_orders() {
        let (grid, spline) = {
            let Some(tpl) = template.order(o) else {
                continue;
            };
            (tpl.wavelength().to_vec(), tpl.spline().clone())
        };
        let (dom_lo, dom_hi) = spline.domain();
        let native_span = (grid.len() - 1) / TEMPLATE_OVERSAMPLING + 1;
        let n_knots =
            ((native_span as f64 / NATIVE_PIXELS_PER_KNOT * coadd.knot_factor) as usize).max(8);

        // Pixels of all contributing exposures in the template rest frame.
        let mut x = Vec::new();
        let mut y = Vec::new();
        let mut e = Vec::new();
        let mut tell = Vec::new();
        let mut clear = Vec::new();
        let mut owner = Vec::new();
        let mut slots: Vec<usize> = Vec::new();

        for &i in contributors {
            let exposure = &exposures[i];
            let pre = pre_rvs[i].velocity_kms;
            let order = &exposure.orders[o];
            let fit = fit_order(
                &OrderFitInput {
                    order,
                    template: &spline,
                    scale,
                    degree: config.degree,
                    clip: config.clip,
                    grid: config.grid,
                    prior_kms: pre,
                    window: (0, order.len()),
                    keep_surface: false,
                    line_width: false,
                },
                FitMode::FixedVelocity(pre),
            );
            if fit.coeffs.is_empty() {
                continue;
            }
            let poly = continuum(&fit.coeffs, fit.wavelength_center, order.wavelength());
            let slot = slots.len();
            slots.push(i);
            let flags = order.flags();
            for px in 0..order.len() {
                if flags[px].intersects(PixelFlags::NAN | PixelFlags::NEG) {
                    continue;
                }
                let rest = scale.to_rest_frame(order.wavelength()[px], pre);
                if rest < dom_lo || rest > dom_hi {
                    continue;
                }
                if !(poly[px] > 0.0) {
                    continue;
                }
                let e_n = order.error()[px] / poly[px];
                let y_n = order.flux()[px] / poly[px];
                if !(e_n > 0.0) || !e_n.is_finite() || !y_n.is_finite() {
                    continue;
                }
                x.push(rest);
                y.push(y_n);
                e.push(e_n);
                tell.push(flags[px].intersects(PixelFlags::ATM | PixelFlags::SKY));
                clear.push(flags[px].is_clear());
                owner.push(slot);
            }
        }
        if x.is_empty() {
            continue;
        }

        let median_e = {
            let mut sorted = e.clone();
            median_inplace(&mut sorted).unwrap_or(f64::NAN)
        };
        let n_set = contributors.len() as f64;
        let w: Vec<f64> = e
            .iter()
            .zip(&tell)
            .map(|(&ei, &is_tell)| {
                if is_tell {
                    coadd.telluric_weight_factor / n_set / (ei * ei + median_e * median_e)
                } else {
                    1.0 / (ei * ei)
                }
            })
            .collect();

        let mut kept: Vec<usize> = (0..x.len()).collect();
        let mut last: Option<(BSplineFit, BSplineFit, Vec<f64>)> = None;
        for it in 0..=coadd.passes {
            let xs: Vec<f64> = kept.iter().map(|&i| x[i]).collect();
            let ys: Vec<f64> = kept.iter().map(|&i| y[i]).collect();
            let ws: Vec<f64> = kept.iter().map(|&i| w[i]).collect();
            let lo = xs.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if !(hi > lo) {
                return Err(TemplateError::Coadd {
                    order: o,
                    source: bspline::BSplineError::EmptyDomain,
                });
            }
            let fit = bspline::fit(
                &BSplineFitConfig {
                    n_knots,
                    domain: (lo, hi),
                    smoothing: coadd.smoothing,
                    mean_prior_weight: coadd.mean_prior_weight,
                },
                &xs,
                &ys,
                &ws,
            )
            .map_err(|source| TemplateError::Coadd { order: o, source })?;

            let residuals: Vec<f64> = kept
                .iter()
                .map(|&i| (y[i] - fit.eval(x[i])) / e[i])
                .collect();
            let open: Vec<f64> = kept
                .iter()
                .zip(&residuals)
                .filter(|&(&i, _)| !tell[i])
                .map(|(_, &r)| r)
                .collect();
            if !std_dev(&open).is_some_and(f64::is_finite) {
                return Err(TemplateError::NonFiniteNoise { order: o });
            }

            // Local reduced chi2 on a coarse knot grid, basis-weighted.
            let kc = (n_knots / LOCAL_NOISE_KNOT_DIVISOR).max(2);
            let spacing = (hi - lo) / (kc - 1) as f64;
            let mut chik = vec![0.0; kc + 2];
            let mut normk = vec![0.0; kc + 2];
            for (&i, &r) in kept.iter().zip(&residuals) {
                let t = (x[i] - lo) / spacing;
                let seg = (t as usize).min(kc - 2);
                let bw = basis_weights(t - seg as f64);
                for (j, &bj) in bw.iter().enumerate() {
                    chik[seg + j] += bj * r * r;
                    normk[seg + j] += bj;
                }
            }
            let coarse: Vec<f64> = chik
                .iter()
                .zip(&normk)
                .map(|(&c, &n)| if n > 0.0 { c / n } else { f64::NAN })
                .collect();
            let noise = BSplineFit::from_coefficients(coarse, (lo, hi))
                .map_err(|source| TemplateError::Coadd { order: o, source })?;

            if it == coadd.passes {
                last = Some((fit, noise, residuals));
                break;
            }
            // A non-finite local noise keeps the pixel.
            let survivors: Vec<usize> = kept
                .iter()
                .zip(&residuals)
                .filter(|&(&i, &r)| {
                    if tell[i] {
                        return true;
                    }
                    let sig = noise.eval(x[i]).sqrt();
                    if !sig.is_finite() || !(sig > 0.0) {
                        return true;
                    }
                    r >= -coadd.kappa_low * sig && r <= coadd.kappa_high * sig
                })
                .map(|(&i, _)| i)
                .collect();
            kept = survivors;
        }
        let Some((fit, noise, residuals)) = last else {
            continue;
        };

        let positions = fit.knot_positions();
        let weight_sums = fit.knot_weight_sums();
        let errors: Vec<f64> = positions
            .iter()
            .zip(weight_sums)
            .map(|(&pos, &wk)| {
                let var = noise.eval(pos);
                if var > 0.0 && var.is_finite() && wk > 0.0 {
                    (var / wk).sqrt()
                } else {
                    f64::NAN
                }
            })
            .collect();
        let mut good_pixels = vec![0u32; fit.n_knots()];
        for &i in &kept {
            if clear[i] {
                good_pixels[fit.nearest_knot(x[i])] += 1;
            }
        }

        // Per-exposure S/N against the coadded curve, rms-summed.
        let mut snr_sq = 0.0;
        for slot in 0..slots.len() {
            let mut flux_slot = Vec::new();
            let mut weight_slot = Vec::new();
            let mut resid_slot = Vec::new();
            let mut error_slot = Vec::new();
            for (&i, &r) in kept.iter().zip(&residuals) {
                if owner[i] != slot {
                    continue;
                }
                flux_slot.push(y[i]);
                weight_slot.push(1.0 / (e[i] * e[i]));
                resid_slot.push(r * e[i]);
                error_slot.push(e[i]);
            }
            let signal = stable_weighted_mean(&flux_slot, &weight_slot);
            let scatter = weighted_rms(&resid_slot, &error_slot);
            if let (Some(s), Some(n)) = (signal, scatter) {
                let sn = s / n;
                if sn.is_finite() && sn > 0.0 {
                    snr_sq += sn * sn;
                }
            }
        }
        let order_snr = if snr_sq > 0.0 { snr_sq.sqrt() } else { f64::NAN };

        let cov_lo = kept.iter().map(|&i| x[i]).fold(f64::INFINITY, f64::min);
        let cov_hi = kept
            .iter()
            .map(|&i| x[i])
            .fold(f64::NEG_INFINITY, f64::max);
        let mut flux = {
            let Some(tpl) = template.order(o) else {
                continue;
            };
            tpl.flux().to_vec()
        };
        for (g, value) in flux.iter_mut().enumerate() {
            if grid[g] >= cov_lo && grid[g] <= cov_hi {
                *value = fit.eval(grid[g]);
            }
        }
        if let Some(tpl) = template.order_mut(o) {
            tpl.replace_flux(flux)
                .map_err(|source| TemplateError::Spline { order: o, source })?;
            tpl.set_knots(KnotDiagnostics {
                wavelength: positions,
                value: fit.knot_values(),
                error: errors,
                good_pixels,
            });
            tpl.set_snr(order_snr);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::PixelWindow;
    use crate::spectrum::ExposureFlags;

    const GRID_STEP: f64 = 4e-6;

    fn line_profile(w: f64) -> f64 {
        let mut f = 1000.0;
        for &(center, depth, width) in &[
            (8.5004, 0.45, 2.8e-5),
            (8.5009, 0.60, 2.4e-5),
            (8.5014, 0.50, 3.2e-5),
        ] {
            let z = (w - center) / width;
            f *= 1.0 - depth * (-0.5 * z * z).exp();
        }
        f
    }

    /// 400-pixel order of the synthetic star at stellar velocity `v_kms`,
    /// with an alternating-sign flux perturbation of relative amplitude
    /// `pattern` and a flat error level.
    fn star_order(v_kms: f64, pattern: f64, error: f64) -> SpectralOrder {
        let n = 400;
        let wavelength: Vec<f64> = (0..n).map(|i| 8.50 + GRID_STEP * i as f64).collect();
        let flux: Vec<f64> = wavelength
            .iter()
            .enumerate()
            .map(|(i, &w)| {
                let rest = WaveScale::LogLambda.to_rest_frame(w, v_kms);
                let wiggle = if i % 2 == 0 { pattern } else { -pattern };
                line_profile(rest) * (1.0 + wiggle)
            })
            .collect();
        let errors = vec![error; n];
        SpectralOrder::new(wavelength, flux, errors, Vec::new()).expect("valid order")
    }

    fn star_exposure(id: &str, v_kms: f64, pattern: f64, error: f64) -> Exposure {
        Exposure {
            id: id.to_string(),
            bjd: 2_459_000.5,
            berv_kms: 0.0,
            drift_mps: 0.0,
            e_drift_mps: 0.0,
            secular_mps: 0.0,
            flags: ExposureFlags::OK,
            orders: vec![star_order(v_kms, pattern, error)],
        }
    }

    fn coadd_config(policy: CoaddPolicy) -> RunConfig {
        let mut config = RunConfig::default();
        config.coadd.policy = policy;
        config.pixel_window = PixelWindow {
            min_px: 20,
            max_px: 380,
        };
        config
    }

    fn build(exposures: &[Exposure], config: &RunConfig) -> CoaddOutcome {
        build_template(&CoaddInput {
            exposures,
            config,
            telluric: None,
            sky: None,
        })
        .expect("coadd succeeds")
    }

    /// Relative rms deviation of the template from the noiseless profile
    /// over interior grid points.
    fn interior_deviation(outcome: &CoaddOutcome) -> f64 {
        let order = outcome.template.order(0).expect("order present");
        let grid = order.wavelength();
        let flux = order.flux();
        let lo = 60 * TEMPLATE_OVERSAMPLING;
        let hi = 340 * TEMPLATE_OVERSAMPLING;
        let mut sum = 0.0;
        let mut count = 0usize;
        for g in (lo..hi).step_by(7) {
            let truth = line_profile(grid[g]);
            let rel = (flux[g] - truth) / truth;
            sum += rel * rel;
            count += 1;
        }
        (sum / count as f64).sqrt()
    }

    #[test]
    fn post3_coadd_cancels_uncorrelated_perturbations() {
        // One exposure carries the opposite perturbation phase of the
        // other two; the weighted merge averages them away.
        let exposures = vec![
            star_exposure("e1", 0.0, 0.04, 1.99),
            star_exposure("e2", 0.0, -0.04, 2.0),
            star_exposure("e3", 0.0, -0.04, 2.0),
        ];
        let config = coadd_config(CoaddPolicy::Post3);
        let outcome = build(&exposures, &config);

        assert_eq!(outcome.template.reference_id(), "e1");
        assert_eq!(outcome.template.n_exposures(), 3);
        assert!(interior_deviation(&outcome) < 0.01);
        for pre in &outcome.pre_rvs {
            assert!(pre.velocity_kms.abs() < 0.05, "pre-RV {}", pre.velocity_kms);
            assert!(pre.e_velocity_mps > 0.0);
        }

        let order = outcome.template.order(0).expect("order present");
        let knots = order.knots();
        assert!(knots.wavelength.len() >= 80);
        assert_eq!(knots.wavelength.len(), knots.value.len());
        assert_eq!(knots.wavelength.len(), knots.error.len());
        assert_eq!(knots.wavelength.len(), knots.good_pixels.len());
        let defined = knots
            .error
            .iter()
            .filter(|e| e.is_finite() && **e > 0.0)
            .count();
        assert!(defined * 2 > knots.error.len());
        let counted: u32 = knots.good_pixels.iter().sum();
        assert!(counted > 1000, "good pixels {counted}");
        // Residuals are dominated by the injected perturbation, so the
        // coadd S/N sits near amplitude over pattern, rms-summed.
        assert!(order.snr() > 20.0 && order.snr() < 100.0, "snr {}", order.snr());
    }

    #[test]
    fn pre_rvs_track_injected_shifts() {
        let mut exposures = vec![
            star_exposure("e1", 0.0, 0.0, 1.99),
            star_exposure("e2", 0.3, 0.0, 2.0),
            star_exposure("e3", -0.2, 0.0, 2.0),
        ];
        // A fourth exposure with every pixel flagged cannot align.
        let dead = {
            let order = star_order(0.0, 0.0, 2.0);
            let flags = vec![PixelFlags::NAN; order.len()];
            SpectralOrder::new(
                order.wavelength().to_vec(),
                order.flux().to_vec(),
                order.error().to_vec(),
                flags,
            )
            .expect("valid order")
        };
        exposures.push(Exposure {
            id: "e4".to_string(),
            bjd: 2_459_001.5,
            berv_kms: 0.0,
            drift_mps: 0.0,
            e_drift_mps: 0.0,
            secular_mps: 0.0,
            flags: ExposureFlags::OK,
            orders: vec![dead],
        });

        let config = coadd_config(CoaddPolicy::Post3);
        let outcome = build(&exposures, &config);

        assert_eq!(outcome.template.reference_id(), "e1");
        assert!(outcome.pre_rvs[0].velocity_kms.abs() < 0.02);
        assert!((outcome.pre_rvs[1].velocity_kms - 0.3).abs() < 0.02);
        assert!((outcome.pre_rvs[2].velocity_kms + 0.2).abs() < 0.02);
        assert!(outcome.pre_rvs[3].velocity_kms.is_nan());
        assert!(outcome.pre_rvs[3].e_velocity_mps.is_nan());
        assert_eq!(outcome.template.n_exposures(), 3);
    }

    #[test]
    fn flying_accumulation_averages_the_exposures() {
        let exposures = vec![
            star_exposure("e1", 0.0, 0.04, 1.99),
            star_exposure("e2", 0.0, -0.04, 2.0),
            star_exposure("e3", 0.0, -0.04, 2.0),
        ];
        let config = coadd_config(CoaddPolicy::Flying);
        let outcome = build(&exposures, &config);

        // Near-equal weights: the seed and its own resample carry the
        // positive phase, the two others the negative one.
        assert!(interior_deviation(&outcome) < 0.01);
        assert_eq!(outcome.template.n_exposures(), 3);
        // No B-spline pass ran, so no knot diagnostics.
        let order = outcome.template.order(0).expect("order present");
        assert!(order.knots().wavelength.is_empty());
    }

    #[test]
    fn post_policy_buffers_and_smooths() {
        let exposures = vec![
            star_exposure("e1", 0.0, 0.04, 1.99),
            star_exposure("e2", 0.0, -0.04, 2.0),
            star_exposure("e3", 0.0, -0.04, 2.0),
        ];
        let config = coadd_config(CoaddPolicy::Post);
        let outcome = build(&exposures, &config);

        assert!(interior_deviation(&outcome) < 0.02);
        assert_eq!(outcome.template.n_exposures(), 3);
    }

    #[test]
    fn telluric_pixels_are_down_weighted_not_clipped() {
        let mut exposures = vec![
            star_exposure("e1", 0.0, 0.0, 1.99),
            star_exposure("e2", 0.0, 0.0, 2.0),
            star_exposure("e3", 0.0, 0.0, 2.0),
        ];
        // Contaminate one exposure: a telluric band with five-fold flux.
        let order = &mut exposures[1].orders[0];
        let wavelength = order.wavelength().to_vec();
        let mut flux = order.flux().to_vec();
        let error = order.error().to_vec();
        let mut flags = vec![PixelFlags::OK; wavelength.len()];
        for px in 180..210 {
            flux[px] *= 5.0;
            flags[px] = PixelFlags::ATM;
        }
        *order = SpectralOrder::new(wavelength, flux, error, flags).expect("valid order");

        let config = coadd_config(CoaddPolicy::Post3);
        let outcome = build(&exposures, &config);
        let tpl = outcome.template.order(0).expect("order present");
        let grid = tpl.wavelength();
        let value = tpl.flux();

        // Inside the band the contaminated pixels pull the template up a
        // few percent: present, but nowhere near their five-fold excess.
        let mut inside = Vec::new();
        for g in 0..grid.len() {
            let px = grid[g];
            if px > 8.50 + GRID_STEP * 188.0 && px < 8.50 + GRID_STEP * 202.0 {
                inside.push((value[g] - line_profile(px)) / line_profile(px));
            }
        }
        assert!(!inside.is_empty());
        let mean_bias = inside.iter().sum::<f64>() / inside.len() as f64;
        assert!(mean_bias > 0.005, "bias {mean_bias}");
        assert!(mean_bias < 0.08, "bias {mean_bias}");

        // Far from the band the template stays on the profile.
        let mut far = 0.0;
        let mut count = 0usize;
        for g in (60 * TEMPLATE_OVERSAMPLING..160 * TEMPLATE_OVERSAMPLING).step_by(7) {
            let rel = (value[g] - line_profile(grid[g])) / line_profile(grid[g]);
            far += rel * rel;
            count += 1;
        }
        assert!((far / count as f64).sqrt() < 0.01);
    }

    #[test]
    fn post3_clips_an_unflagged_spike() {
        let mut exposures = vec![
            star_exposure("e1", 0.0, 0.0, 1.99),
            star_exposure("e2", 0.0, 0.0, 2.0),
            star_exposure("e3", 0.0, 0.0, 2.0),
            star_exposure("e4", 0.0, 0.0, 2.0),
        ];
        let order = &mut exposures[1].orders[0];
        let wavelength = order.wavelength().to_vec();
        let mut flux = order.flux().to_vec();
        let error = order.error().to_vec();
        // A 20-sigma excursion on one pixel of the continuum.
        flux[150] += 40.0;
        *order = SpectralOrder::new(wavelength, flux, error, Vec::new()).expect("valid order");

        let config = coadd_config(CoaddPolicy::Post3);
        let outcome = build(&exposures, &config);
        let tpl = outcome.template.order(0).expect("order present");
        let grid = tpl.wavelength();
        let value = tpl.flux();

        for g in 148 * TEMPLATE_OVERSAMPLING..153 * TEMPLATE_OVERSAMPLING {
            let rel = (value[g] - line_profile(grid[g])) / line_profile(grid[g]);
            assert!(rel.abs() < 0.005, "residual {rel} at grid {g}");
        }
    }

    #[test]
    fn mismatched_order_counts_are_rejected() {
        let mut exposures = vec![
            star_exposure("e1", 0.0, 0.0, 1.99),
            star_exposure("e2", 0.0, 0.0, 2.0),
        ];
        exposures[1].orders.push(star_order(0.0, 0.0, 2.0));

        let config = coadd_config(CoaddPolicy::Post3);
        let err = build_template(&CoaddInput {
            exposures: &exposures,
            config: &config,
            telluric: None,
            sky: None,
        })
        .expect_err("order mismatch");
        assert!(matches!(err, TemplateError::MismatchedOrders { .. }));
    }

    #[test]
    fn post2_policy_is_refused() {
        let exposures = vec![star_exposure("e1", 0.0, 0.0, 2.0)];
        let config = coadd_config(CoaddPolicy::Post2);
        let err = build_template(&CoaddInput {
            exposures: &exposures,
            config: &config,
            telluric: None,
            sky: None,
        })
        .expect_err("retired policy");
        assert!(matches!(err, TemplateError::UnresolvedPolicy));
    }
}
