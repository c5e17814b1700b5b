//! Runner – drives one nettest from settings text to `status.end`.
//!
//! Every step is turned into events; the runner decides per step whether a
//! failure aborts the run or degrades it:
//!
//! | step            | on failure                                    |
//! |-----------------|-----------------------------------------------|
//! | settings/inputs | `failure.startup`, end with `value_error`     |
//! | admission       | `failure.startup` (interrupted)               |
//! | bouncer         | `failure.startup`, abort unless ignored       |
//! | geolocation     | `log` warning, placeholders kept              |
//! | report open     | `failure.report_create`, abort unless ignored |
//! | measurement     | `failure.measurement`, run continues          |
//! | submission      | `failure.measurement_submission`, continues   |
//! | report close    | `failure.report_close`, run continues         |

use crate::admission::Admission;
use crate::context::{ByteCounters, EngineContext, RunContext};
use crate::error::{NettestError, RunError};
use crate::event::{Emitter, Event};
use crate::nettest::Nettest;
use crate::settings::{LogLevel, Settings};
use crate::task::{StateCell, TaskState};
use crate::traits::InputPolicy;
use std::fs::{File, OpenOptions};
use std::io::Write;

const PROGRESS_BOUNCER: f64 = 0.1;
const PROGRESS_GEOIP: f64 = 0.2;
const PROGRESS_REPORT: f64 = 0.4;
const PROGRESS_MEASUREMENTS: f64 = 0.5;

/// Everything the worker hands to the runner.
pub(crate) struct RunRequest {
    pub settings_text: String,
    pub engine: EngineContext,
    pub admission: Admission,
    pub ctx: RunContext,
    pub state: StateCell,
}

/// Run to completion. The emitter is consumed so the queue closes on return.
pub(crate) async fn run(req: RunRequest, mut emitter: Emitter) {
    emitter.emit(Event::Queued {});
    let outcome = execute(&req, &mut emitter).await;

    let failure = match &outcome {
        Ok(()) => String::new(),
        Err(e) => {
            tracing::info!(error = %e, "nettest aborted");
            e.end_failure().to_string()
        }
    };
    let counters = req.ctx.counters();
    emitter.emit(Event::End {
        downloaded_kb: counters.downloaded_kb(),
        failure,
        uploaded_kb: counters.uploaded_kb(),
    });
}

/// Stream for a task whose worker could not be set up.
pub(crate) fn abort(emitter: Emitter, error: RunError) {
    tracing::error!(error = %error, "cannot run nettest");
    emitter.emit(Event::Queued {});
    emitter.emit(Event::startup_failure(&error));
    emitter.emit(Event::End {
        downloaded_kb: 0.0,
        failure: error.end_failure().to_string(),
        uploaded_kb: 0.0,
    });
}

/// Close the stream of a run whose worker panicked part way through.
pub(crate) fn crashed(emitter: Emitter, error: RunError, counters: &ByteCounters) {
    tracing::error!(error = %error, "nettest worker panicked");
    emitter.emit(Event::startup_failure(&error));
    emitter.emit(Event::End {
        downloaded_kb: counters.downloaded_kb(),
        failure: error.end_failure().to_string(),
        uploaded_kb: counters.uploaded_kb(),
    });
}

async fn execute(req: &RunRequest, emitter: &mut Emitter) -> Result<(), RunError> {
    let settings = match Settings::parse(&req.settings_text) {
        Ok(s) => s,
        Err(e) => return Err(startup_error(emitter, RunError::Settings(e.to_string()))),
    };
    emitter.configure(&settings);

    let (mut nettest, inputs) = match prepare(&req.engine, &settings) {
        Ok(prepared) => prepared,
        Err(e) => return Err(startup_error(emitter, e)),
    };

    let ctx = &req.ctx;
    let Some(_permit) = req.admission.acquire(ctx.cancel_token()).await else {
        return Err(startup_error(emitter, RunError::Interrupted));
    };
    req.state.set(TaskState::Started);
    emitter.emit(Event::Started {});
    req.state.set(TaskState::Running);
    tracing::info!(nettest = nettest.test_name(), inputs = inputs.len(), "nettest started");

    // Bouncer
    if settings.options.no_bouncer {
        emitter.emit(Event::log(LogLevel::Info, "bouncer disabled"));
        emitter.emit(Event::progress(PROGRESS_BOUNCER, "bouncer skipped"));
    } else {
        match bouncer_phase(&mut nettest, ctx).await {
            Ok(()) => emitter.emit(Event::progress(PROGRESS_BOUNCER, "contacted bouncer")),
            Err(e) => {
                emitter.emit(Event::startup_failure(&e));
                if !settings.options.ignore_bouncer_error {
                    return Err(RunError::Bouncer(e));
                }
                tracing::warn!(error = %e, "ignoring bouncer error");
                emitter.emit(Event::log(
                    LogLevel::Warning,
                    format!("ignoring bouncer error: {}", e),
                ));
            }
        }
    }

    // Geolocation
    if let Err(e) = nettest.geolocate(ctx).await {
        tracing::warn!(error = %e, "geolocation failed");
        emitter.emit(Event::log(
            LogLevel::Warning,
            format!("geolocation failed: {}", e),
        ));
    }
    let geo = &nettest.geo_info;
    emitter.emit(Event::GeoipLookup {
        probe_ip: geo.probe_ip.clone(),
        probe_asn: geo.probe_asn.clone(),
        probe_cc: geo.probe_cc.clone(),
        probe_network_name: geo.probe_network_name.clone(),
    });
    emitter.emit(Event::progress(PROGRESS_GEOIP, "geoip lookup"));

    // Report
    if settings.options.no_collector {
        emitter.emit(Event::log(LogLevel::Info, "collector disabled"));
    } else {
        match nettest.open_report(ctx).await {
            Ok(report_id) => {
                tracing::info!(report_id, "report opened");
                emitter.emit(Event::ReportCreate {
                    report_id: report_id.to_string(),
                });
            }
            Err(e) => {
                emitter.emit(Event::FailureReportCreate {
                    failure: e.to_string(),
                });
                if !settings.options.ignore_open_report_error {
                    return Err(RunError::ReportCreate(e));
                }
                tracing::warn!(error = %e, "ignoring open report error");
                emitter.emit(Event::log(
                    LogLevel::Warning,
                    format!("ignoring open report error: {}", e),
                ));
            }
        }
    }
    emitter.emit(Event::progress(PROGRESS_REPORT, "open report"));

    let outcome = measure_all(&mut nettest, &settings, &inputs, ctx, emitter).await;
    if outcome.is_ok() {
        emitter.emit(Event::progress(1.0, "measurement complete"));
    }
    close_report(&mut nettest, ctx, emitter).await;
    outcome
}

fn startup_error(emitter: &Emitter, error: RunError) -> RunError {
    tracing::warn!(error = %error, "nettest startup failed");
    emitter.emit(Event::startup_failure(&error));
    error
}

/// Build the nettest from settings and decide the list of inputs.
fn prepare(engine: &EngineContext, settings: &Settings) -> Result<(Nettest, Vec<String>), RunError> {
    let body = match engine.nettests().create(&settings.name, settings) {
        None => return Err(RunError::UnknownNettest(settings.name.clone())),
        Some(Err(e)) => return Err(RunError::Settings(e)),
        Some(Ok(body)) => body,
    };

    let mut inputs = settings
        .collect_inputs()
        .map_err(|e| RunError::Settings(e.to_string()))?;
    match body.input_policy() {
        InputPolicy::None if !inputs.is_empty() => {
            return Err(RunError::Settings(format!(
                "{} does not take any input",
                settings.name
            )));
        }
        InputPolicy::Required if inputs.is_empty() => {
            return Err(RunError::Settings(format!("{} requires input", settings.name)));
        }
        InputPolicy::None | InputPolicy::Optional if inputs.is_empty() => {
            inputs.push(String::new());
        }
        _ => {}
    }

    let options = &settings.options;
    let mut nettest = Nettest::new(engine, body);
    if !options.bouncer_base_url.is_empty() {
        nettest.bouncer_base_url = options.bouncer_base_url.clone();
    }
    if !options.no_bouncer {
        check_address("bouncer", &nettest.bouncer_base_url)?;
    }
    if !options.collector_base_url.is_empty() {
        check_address("collector", &options.collector_base_url)?;
        nettest.collector_override = Some(options.collector_base_url.clone());
    }
    nettest.software_name = settings.software_name();
    nettest.software_version = settings.software_version();
    nettest.annotations = settings.annotations.clone();
    nettest.asn_db_path = options.geoip_asn_path.clone();
    nettest.save_real_probe_ip = options.save_real_probe_ip;
    Ok((nettest, inputs))
}

fn check_address(role: &'static str, url: &str) -> Result<(), RunError> {
    match reqwest::Url::parse(url) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => Ok(()),
        _ => Err(RunError::InvalidAddress {
            role,
            url: url.to_string(),
        }),
    }
}

async fn bouncer_phase(nettest: &mut Nettest, ctx: &RunContext) -> Result<(), NettestError> {
    nettest.discover_collectors(ctx).await?;
    nettest.discover_test_helpers(ctx).await?;
    let selected = nettest.select_collector()?;
    tracing::debug!(collector = %selected.address, "selected collector");
    Ok(())
}

async fn measure_all(
    nettest: &mut Nettest,
    settings: &Settings,
    inputs: &[String],
    ctx: &RunContext,
    emitter: &Emitter,
) -> Result<(), RunError> {
    let mut output = open_output(&settings.output_filepath, emitter);
    let submit = nettest.has_report() && !settings.options.no_collector;
    let total = inputs.len();

    for (idx, input) in inputs.iter().enumerate() {
        if ctx.is_cancelled() {
            emitter.emit(Event::log(LogLevel::Warning, "interrupted"));
            return Err(RunError::Interrupted);
        }
        emitter.emit(Event::MeasurementStart {
            idx,
            input: input.clone(),
        });

        let (mut measurement, failure) = nettest.measure(ctx, input).await;
        if !failure.is_empty() {
            emitter.emit(Event::FailureMeasurement {
                failure,
                idx,
                input: input.clone(),
            });
        }

        let json_str = match serde_json::to_string(&measurement) {
            Ok(text) => text,
            Err(e) => {
                emitter.emit(Event::BugJsonDump {
                    failure: "internal_error".to_string(),
                });
                return Err(RunError::Serialization(e.to_string()));
            }
        };
        emitter.emit(Event::Measurement {
            idx,
            input: input.clone(),
            json_str: json_str.clone(),
        });
        if let Some(file) = output.as_mut() {
            if let Err(e) = writeln!(file, "{}", json_str) {
                emitter.emit(Event::log(
                    LogLevel::Warning,
                    format!("cannot write measurement to {}: {}", settings.output_filepath, e),
                ));
            }
        }

        if submit {
            match nettest.submit(ctx, &mut measurement).await {
                Ok(measurement_id) => {
                    tracing::debug!(idx, measurement_id, "measurement submitted");
                    emitter.emit(Event::MeasurementSubmission {
                        idx,
                        input: input.clone(),
                    });
                }
                Err(e) => {
                    tracing::warn!(idx, error = %e, "measurement submission failed");
                    emitter.emit(Event::FailureMeasurementSubmission {
                        failure: e.to_string(),
                        idx,
                        input: input.clone(),
                        json_str,
                    });
                }
            }
        }

        emitter.emit(Event::MeasurementDone {
            idx,
            input: input.clone(),
        });
        let fraction = (idx + 1) as f64 / total as f64;
        emitter.emit(Event::progress(
            PROGRESS_REPORT + PROGRESS_MEASUREMENTS * fraction,
            format!("measured {}/{}", idx + 1, total),
        ));
    }
    Ok(())
}

fn open_output(path: &str, emitter: &Emitter) -> Option<File> {
    if path.is_empty() {
        return None;
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(f) => Some(f),
        Err(e) => {
            emitter.emit(Event::log(
                LogLevel::Warning,
                format!("cannot open output file {}: {}", path, e),
            ));
            None
        }
    }
}

async fn close_report(nettest: &mut Nettest, ctx: &RunContext, emitter: &Emitter) {
    match nettest.close_report(ctx).await {
        Ok(None) => {}
        Ok(Some(report_id)) => {
            tracing::info!(report_id, "report closed");
            emitter.emit(Event::ReportClose { report_id });
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot close report");
            emitter.emit(Event::FailureReportClose {
                failure: e.to_string(),
            });
        }
    }
}
