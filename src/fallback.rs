//! Offline placeholder payloads for API endpoints.
//!
//! When neither the network nor any partition can answer an API request, the
//! display still needs something shaped like the real response. Each payload
//! mirrors its endpoint's schema and carries `offline: true`.

use chrono::{DateTime, Datelike, TimeZone};
use serde_json::{json, Map, Value};

use crate::http::{Response, OFFLINE_HEADER};

/// Endpoints with a dedicated placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
  PrayerTimes,
  Settings,
  WeatherForecast,
  Weather,
  Announcements,
  QuranVerses,
  FinancialReports,
  DisasterWarnings,
}

/// Substring patterns in the order they are tried. `/weather-forecast` must
/// precede `/weather`, which it contains.
pub const PRIORITY: &[(&str, Endpoint)] = &[
  ("/prayer-times", Endpoint::PrayerTimes),
  ("/settings", Endpoint::Settings),
  ("/weather-forecast", Endpoint::WeatherForecast),
  ("/weather", Endpoint::Weather),
  ("/announcements", Endpoint::Announcements),
  ("/quran-verses", Endpoint::QuranVerses),
  ("/financial-reports", Endpoint::FinancialReports),
  ("/disaster-warnings", Endpoint::DisasterWarnings),
];

const NO_DATA_MESSAGE: &str = "Data tidak tersedia";

/// Find the placeholder endpoint for a request path.
pub fn endpoint_for(path: &str) -> Option<Endpoint> {
  PRIORITY
    .iter()
    .find(|(pattern, _)| path.contains(pattern))
    .map(|(_, endpoint)| *endpoint)
}

/// Build the placeholder payload for `path` at time `now`. Never fails.
pub fn synthesize<Tz: TimeZone>(path: &str, now: &DateTime<Tz>) -> Value {
  match endpoint_for(path) {
    Some(Endpoint::PrayerTimes) => json!({
      "fajr": "04:30",
      "syuruq": "05:45",
      "dhuhr": "12:00",
      "asr": "15:15",
      "maghrib": "18:00",
      "isha": "19:15",
      "imsya": "04:20",
      "next_prayer": "dhuhr",
      "is_iqomah_countdown": false,
      "iqomah_times": {
        "fajr": "04:40",
        "dhuhr": "12:10",
        "asr": "15:25",
        "maghrib": "18:05",
        "isha": "19:25"
      },
      "date_gregorian": format!("{}/{}/{}", now.day(), now.month(), now.year()),
      "date_hijri": "Offline Mode",
      "offline": true
    }),
    Some(Endpoint::Settings) => json!({
      "mosque_name": "MASJID AL HIDAYAH",
      "mosque_address": "Offline Mode",
      "city_name": "Malang",
      "latitude": -7.9666,
      "longitude": 112.6326,
      "theme": "midnight",
      "font_size": "normal",
      "use_manual_prayer_times": false,
      "offline": true
    }),
    Some(Endpoint::WeatherForecast) => {
      let mut forecast = Map::new();
      for hour in 0..24 {
        forecast.insert(
          hour.to_string(),
          json!({
            "temperature": 27,
            "humidity": 75,
            "precipitation": 0,
            "weather_code": 1,
            "description": "Cerah Berawan",
            "icon": "🌤️",
            "source": "Offline"
          }),
        );
      }
      json!({
        "success": true,
        "forecast": forecast,
        "offline": true
      })
    }
    Some(Endpoint::Weather) => json!({
      "temperature": 27,
      "humidity": 75,
      "description": "Cerah Berawan",
      "source": "Offline",
      "offline": true
    }),
    Some(Endpoint::Announcements) => json!([{
      "text": "Aplikasi dalam mode offline. Data mungkin tidak terbaru.",
      "offline": true
    }]),
    Some(Endpoint::QuranVerses) => json!([{
      "arabic": "إِنَّ مَعَ ٱلْعُسْرِ يُسْرًا",
      "translation": "Sesungguhnya bersama kesulitan ada kemudahan",
      "surah": "Al-Insyirah",
      "ayah": 6,
      "offline": true
    }]),
    Some(Endpoint::FinancialReports) => json!([{
      "saldo_pekan_lalu": 0,
      "infaq_pekan_ini": 0,
      "pengeluaran": 0,
      "saldo_pekan_ini": 0,
      "offline": true
    }]),
    Some(Endpoint::DisasterWarnings) => json!({
      "has_warning": false,
      "message": "Mode offline - data peringatan tidak tersedia",
      "offline": true
    }),
    None => json!({
      "offline": true,
      "message": NO_DATA_MESSAGE
    }),
  }
}

/// Wrap the placeholder for `path` in a 200 response marked as offline.
pub fn offline_response<Tz: TimeZone>(path: &str, now: &DateTime<Tz>) -> Response {
  let payload = synthesize(path, now);
  let mut response = Response::json(&payload).with_header(OFFLINE_HEADER, "true");
  response.status_text = "OK (Offline)".to_string();
  response
}
