//! Time-series sink: every reading lands in a hypertable-shaped
//! Postgres table; `weather_1m` is a view computing one-minute
//! mean/min/max rows on read, standing in for a TimescaleDB continuous
//! aggregate (documented substitution, see DESIGN.md) since plain
//! sqlx/Postgres has no native continuous-aggregate object.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::error::{StorageError, ValidationError};
use crate::reading::{BucketReading, Reading};

use super::HealthCheckable;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS readings (
    time TIMESTAMPTZ NOT NULL,
    station_name TEXT NOT NULL,
    outside_temperature DOUBLE PRECISION,
    outside_humidity DOUBLE PRECISION,
    barometer DOUBLE PRECISION,
    wind_speed DOUBLE PRECISION,
    wind_gust_10m DOUBLE PRECISION,
    wind_direction INTEGER,
    rain_incremental DOUBLE PRECISION,
    rain_day DOUBLE PRECISION,
    snow_distance_mm INTEGER,
    solar_radiation DOUBLE PRECISION,
    uv_index DOUBLE PRECISION,
    PRIMARY KEY (time, station_name)
);
CREATE INDEX IF NOT EXISTS readings_station_time_idx ON readings (station_name, time DESC);

CREATE OR REPLACE VIEW weather_1m AS
SELECT
    date_trunc('minute', time) AS bucket,
    station_name,
    avg(outside_temperature) AS out_temp_avg,
    min(outside_temperature) AS out_temp_min,
    max(outside_temperature) AS out_temp_max,
    avg(outside_humidity) AS out_humidity_avg,
    avg(barometer) AS barometer_avg,
    avg(wind_speed) AS wind_speed_avg,
    max(wind_gust_10m) AS wind_gust_max,
    avg(wind_direction)::double precision AS wind_direction_avg,
    sum(rain_incremental) AS rain_incremental_sum,
    max(rain_day) AS rain_day,
    avg(snow_distance_mm)::double precision AS snow_distance_avg,
    avg(solar_radiation) AS solar_radiation_avg,
    avg(uv_index) AS uv_index_avg
FROM readings
GROUP BY bucket, station_name;
";

pub struct TimeSeriesSink {
    name: String,
    pool: PgPool,
}

impl TimeSeriesSink {
    pub async fn connect(name: impl Into<String>, connection_string: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(25)
            .min_connections(10)
            .max_lifetime(Duration::from_secs(3600))
            .connect(connection_string)
            .await
            .map_err(StorageError::QueryFailed)?;

        let sink = Self { name: name.into(), pool };
        sqlx::query(SCHEMA_SQL)
            .execute(&sink.pool)
            .await
            .map_err(StorageError::QueryFailed)?;
        Ok(sink)
    }

    /// Best-effort insert: failures are logged at `warn` and the
    /// reading is dropped, since the device stream is the source of
    /// truth and will resample within seconds (spec.md §4.4).
    pub async fn insert(&self, reading: &Reading) {
        let result = sqlx::query(
            "INSERT INTO readings (time, station_name, outside_temperature, outside_humidity,
                barometer, wind_speed, wind_gust_10m, wind_direction, rain_incremental, rain_day,
                snow_distance_mm, solar_radiation, uv_index)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             ON CONFLICT (time, station_name) DO NOTHING",
        )
        .bind(reading.timestamp)
        .bind(&reading.station_name)
        .bind(reading.outside_temperature)
        .bind(reading.outside_humidity)
        .bind(reading.barometer)
        .bind(reading.wind_speed)
        .bind(reading.wind_gust_10m)
        .bind(reading.wind_direction.map(|d| d as i32))
        .bind(reading.rain_incremental)
        .bind(reading.rain_day)
        .bind(reading.snow_distance_mm)
        .bind(reading.solar_radiation)
        .bind(reading.uv_index)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(sink = %self.name, station = %reading.station_name, error = %e, "time-series insert failed, reading dropped");
        }
    }

    fn row_to_bucket(row: &sqlx::postgres::PgRow) -> BucketReading {
        BucketReading {
            bucket: row.get("bucket"),
            station_name: row.get("station_name"),
            out_temp_avg: row.get("out_temp_avg"),
            out_temp_min: row.get("out_temp_min"),
            out_temp_max: row.get("out_temp_max"),
            out_humidity_avg: row.get("out_humidity_avg"),
            barometer_avg: row.get("barometer_avg"),
            wind_speed_avg: row.get("wind_speed_avg"),
            wind_gust_max: row.get("wind_gust_max"),
            wind_direction_avg: row.get("wind_direction_avg"),
            rain_incremental_sum: row.get("rain_incremental_sum"),
            rain_day: row.get("rain_day"),
            snow_distance_avg: row.get("snow_distance_avg"),
            solar_radiation_avg: row.get("solar_radiation_avg"),
            uv_index_avg: row.get("uv_index_avg"),
        }
    }

    /// `weather_1m` rows newer than `now - span`, oldest first.
    pub async fn weather_span(
        &self,
        station_name: &str,
        span: Duration,
    ) -> Result<(DateTime<Utc>, Vec<BucketReading>), ValidationError> {
        let span_start = Utc::now() - chrono::Duration::from_std(span).unwrap_or_default();
        let rows = sqlx::query(
            "SELECT * FROM weather_1m WHERE station_name = $1 AND bucket > $2 ORDER BY bucket ASC",
        )
        .bind(station_name)
        .bind(span_start)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            tracing::warn!(sink = %self.name, error = %e, "weather span query failed");
            ValidationError::NoReadingsFound(station_name.to_string())
        })?;

        Ok((span_start, rows.iter().map(Self::row_to_bucket).collect()))
    }

    /// Most recent `weather_1m` row for `station_name`.
    pub async fn latest_reading(&self, station_name: &str) -> Result<BucketReading, ValidationError> {
        let row = sqlx::query(
            "SELECT * FROM weather_1m WHERE station_name = $1 ORDER BY bucket DESC LIMIT 1",
        )
        .bind(station_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::warn!(sink = %self.name, error = %e, "latest reading query failed");
            ValidationError::NoReadingsFound(station_name.to_string())
        })?;

        row.as_ref()
            .map(Self::row_to_bucket)
            .ok_or_else(|| ValidationError::NoReadingsFound(station_name.to_string()))
    }
}

#[async_trait::async_trait]
impl HealthCheckable for TimeSeriesSink {
    fn sink_name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<(), String> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
