// navigator.geolocation as a LocationSensor
//
// watchPosition keeps retrying on its own after transient errors, so every
// callback is forwarded as-is and only the page decides what ends a watch.

use beacon_core::watcher::{SensorSink, WatchHandle};
use beacon_core::{LocationSample, LocationSensor, SensorError, SensorEvent};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{Geolocation, GeolocationPosition, GeolocationPositionError, PositionOptions};

// GeolocationPositionError codes
const PERMISSION_DENIED: u16 = 1;
const POSITION_UNAVAILABLE: u16 = 2;
const TIMEOUT: u16 = 3;

#[derive(Debug, Clone, Copy)]
struct WatchOptions {
    high_accuracy: bool,
    timeout_ms: u32,
    maximum_age_ms: u32,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout_ms: 30_000,
            maximum_age_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BrowserGeolocation {
    options: WatchOptions,
}

impl BrowserGeolocation {
    fn geolocation() -> Result<Geolocation, SensorError> {
        web_sys::window()
            .ok_or(SensorError::Unsupported)?
            .navigator()
            .geolocation()
            .map_err(|_| SensorError::Unsupported)
    }
}

/// Active watchPosition; the callbacks live exactly as long as the watch
struct BrowserWatch {
    geolocation: Geolocation,
    watch_id: i32,
    _on_fix: Closure<dyn FnMut(GeolocationPosition)>,
    _on_error: Closure<dyn FnMut(GeolocationPositionError)>,
}

impl WatchHandle for BrowserWatch {
    fn cancel(self: Box<Self>) {
        log::debug!("Clearing geolocation watch {}", self.watch_id);
        self.geolocation.clear_watch(self.watch_id);
    }
}

impl LocationSensor for BrowserGeolocation {
    fn watch(&self, sink: SensorSink) -> Result<Box<dyn WatchHandle>, SensorError> {
        let geolocation = Self::geolocation()?;

        let fix_sink = sink.clone();
        let on_fix = Closure::wrap(Box::new(move |position: GeolocationPosition| {
            let sample = sample_from_position(&position);
            if fix_sink.unbounded_send(SensorEvent::Fix(sample)).is_err() {
                log::debug!("Fix arrived after the watch was released");
            }
        }) as Box<dyn FnMut(GeolocationPosition)>);

        let on_error = Closure::wrap(Box::new(move |error: GeolocationPositionError| {
            let error = sensor_error_from_code(error.code(), &error.message());
            if sink.unbounded_send(SensorEvent::Error(error)).is_err() {
                log::debug!("Sensor error arrived after the watch was released");
            }
        }) as Box<dyn FnMut(GeolocationPositionError)>);

        let options = PositionOptions::new();
        options.set_enable_high_accuracy(self.options.high_accuracy);
        options.set_timeout(self.options.timeout_ms);
        options.set_maximum_age(self.options.maximum_age_ms);

        let watch_id = geolocation
            .watch_position_with_error_callback_and_options(
                on_fix.as_ref().unchecked_ref(),
                Some(on_error.as_ref().unchecked_ref()),
                &options,
            )
            .map_err(|e| {
                log::error!("watchPosition failed: {:?}", e);
                SensorError::Unsupported
            })?;

        log::info!("Geolocation watch {} started", watch_id);
        Ok(Box::new(BrowserWatch {
            geolocation,
            watch_id,
            _on_fix: on_fix,
            _on_error: on_error,
        }))
    }
}

/// Plain copy of a GeolocationPosition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    /// Milliseconds since the epoch
    pub timestamp_ms: f64,
}

fn sample_from_position(position: &GeolocationPosition) -> LocationSample {
    let coords = position.coords();
    sample_from_fix(&RawFix {
        latitude: coords.latitude(),
        longitude: coords.longitude(),
        accuracy: coords.accuracy(),
        altitude: coords.altitude(),
        speed: coords.speed(),
        heading: coords.heading(),
        timestamp_ms: position.timestamp(),
    })
}

pub fn sample_from_fix(fix: &RawFix) -> LocationSample {
    LocationSample::new(
        fix.latitude,
        fix.longitude,
        (fix.timestamp_ms / 1000.0).floor() as i64,
    )
    .with_accuracy(Some(fix.accuracy))
    .with_altitude(fix.altitude)
    .with_speed(fix.speed)
    .with_bearing(fix.heading)
}

pub fn sensor_error_from_code(code: u16, message: &str) -> SensorError {
    match code {
        PERMISSION_DENIED => SensorError::PermissionDenied,
        TIMEOUT => SensorError::Timeout,
        POSITION_UNAVAILABLE => SensorError::PositionUnavailable(message.to_string()),
        other => SensorError::PositionUnavailable(format!("{} (code {})", message, other)),
    }
}
