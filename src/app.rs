//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments and starts logging
//! - runs the fit pipeline
//! - prints reports/plots
//! - writes optional exports

use clap::Parser;
use flexi_logger::Logger;
use log::warn;

use crate::cli::{Cli, Command, FitArgs, PlotArgs};
use crate::domain::{FitConfig, FitterConfig, IrfSettings, ModelConfig, SampleConfig, TransformSettings};
use crate::error::{FitError, Result};

pub mod pipeline;

/// Entry point for the `flimfit` binary.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // Keep the handle alive for the whole run so buffered output is flushed on exit.
    let _logger = Logger::try_with_env_or_str(&cli.log_level)
        .and_then(|logger| logger.log_to_stderr().start())
        .map_err(|e| FitError::config(format!("Failed to initialize logging: {e}")))?;

    match cli.command {
        Command::Fit(args) => handle_fit(args),
        Command::Plot(args) => handle_plot(args),
    }
}

fn handle_fit(args: FitArgs) -> Result<()> {
    let config = fit_config_from_args(&args);
    let run = pipeline::run_fit(&config)?;

    println!(
        "{}",
        crate::report::format_run_summary(&run.data, &run.outcome, &run.linear, &run.rates, &config)
    );
    if !run.fit_successful {
        warn!("Fit did not produce a usable result: {}", run.outcome.reason);
    }

    let rankings = crate::report::rank_regions(&run.linear, &run.rates, config.top_n);
    println!("{}", crate::report::format_rankings(&rankings));

    if config.plot {
        match run.linear.regions.get(config.plot_region) {
            Some(region) => {
                let acq = run.data.acquisition();
                let plot = crate::plot::render_decay_plot(
                    &acq.timepoints(),
                    acq.n_chan(),
                    region,
                    config.plot_width,
                    config.plot_height,
                );
                println!("{plot}");
            }
            None => warn!(
                "Plot region {} out of range ({} regions fitted)",
                config.plot_region,
                run.linear.regions.len()
            ),
        }
    }

    // Optional exports.
    if let Some(path) = &config.export_results {
        crate::io::write_results_csv(path, &run.linear, &run.rates)?;
    }
    if let Some(path) = &config.export_json {
        let results = crate::io::build_results(
            &run.data,
            &run.model,
            &config.fitter,
            &run.outcome,
            &run.linear,
            &run.rates,
        );
        crate::io::write_results_json(path, &results)?;
    }

    Ok(())
}

fn handle_plot(args: PlotArgs) -> Result<()> {
    let results = crate::io::read_results_json(&args.results)?;
    let plot = crate::plot::render_results_plot(&results, args.region, args.width, args.height)?;
    println!("{plot}");
    Ok(())
}

pub fn fit_config_from_args(args: &FitArgs) -> FitConfig {
    let s = &args.sample;
    FitConfig {
        sample: SampleConfig {
            n_regions: s.regions,
            n_empty_regions: s.empty_regions,
            n_chan: s.channels,
            n_t: s.bins,
            bin_width: s.bin_width,
            lifetimes: s.lifetimes.clone(),
            counts_per_region: s.counts,
            background: s.background,
            irf_center: s.irf_center,
            irf_fwhm: s.irf_fwhm,
            noise_free: s.noise_free,
            seed: s.seed,
        },
        model: ModelConfig {
            n_exp: args.initial.len(),
            convolver: args.convolver,
            channel_factors: args.channel_factors.clone(),
            fit_offset: args.fit_offset,
            fit_t0: args.fit_t0,
            t0_shift: args.t0_shift,
        },
        fitter: FitterConfig {
            n_thread: args.threads,
            weighting: args.weighting,
            derivatives: args.derivatives,
            ftol: args.ftol,
            xtol: args.xtol,
            gtol: args.gtol,
            ..FitterConfig::default()
        },
        transform: TransformSettings {
            t_start: args.t_start.unwrap_or(f64::NEG_INFINITY),
            t_stop: args.t_stop.unwrap_or(f64::INFINITY),
            background: args.subtract,
            threshold: args.threshold,
            limit: args.limit,
        },
        irf: IrfSettings {
            timebin_t0: 0.0,
            timebin_width: args.irf_bin_width,
            reference_reconvolution: args.reference,
            reference_lifetime: args.reference_lifetime,
        },
        initial_lifetimes: args.initial.clone(),
        max_iterations: args.max_iterations,
        top_n: args.top,
        plot: !args.no_plot,
        plot_region: args.plot_region,
        plot_width: args.width,
        plot_height: args.height,
        export_results: args.export.clone(),
        export_json: args.export_json.clone(),
    }
}
