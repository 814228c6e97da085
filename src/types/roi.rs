//! Region of interest on the sensor

use serde::{Deserialize, Serialize};

/// Readout window. Coordinates are 1-based, matching the camera's convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub xstart: u32,
    pub ystart: u32,
    pub width: u32,
    pub height: u32,
    pub xbin: u32,
    pub ybin: u32,
}

impl Roi {
    /// Unbinned full-sensor window.
    pub fn full(sensor_width: u32, sensor_height: u32) -> Self {
        Self { xstart: 1, ystart: 1, width: sensor_width, height: sensor_height, xbin: 1, ybin: 1 }
    }

    /// Image width after binning.
    pub fn binned_width(&self) -> u32 {
        self.width / self.xbin.max(1)
    }

    /// Image height after binning.
    pub fn binned_height(&self) -> u32 {
        self.height / self.ybin.max(1)
    }

    /// Bytes of one 16-bit image read out through this window.
    pub fn image_bytes(&self) -> usize {
        self.binned_width() as usize * self.binned_height() as usize * super::BYTES_PER_PIXEL
    }
}

/// Caller's ROI request. Non-positive values select defaults
/// (bin 1, start 1, full extent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiRequest {
    pub xbin: i32,
    pub ybin: i32,
    pub xstart: i32,
    pub ystart: i32,
    pub width: i32,
    pub height: i32,
}

impl Default for RoiRequest {
    fn default() -> Self {
        Self { xbin: 1, ybin: 1, xstart: 1, ystart: 1, width: -1, height: -1 }
    }
}

impl RoiRequest {
    /// Clamp the request onto a sensor of the given size.
    ///
    /// Starts are aligned down onto the bin grid and extents are trimmed to
    /// whole bins inside the sensor. A window that ends up empty falls back to
    /// the full sensor width (or height) in whole bins.
    pub fn normalize(&self, sensor_width: u32, sensor_height: u32) -> Roi {
        let (xstart, width, xbin) =
            normalize_axis(self.xbin, self.xstart, self.width, sensor_width as i64);
        let (ystart, height, ybin) =
            normalize_axis(self.ybin, self.ystart, self.height, sensor_height as i64);
        Roi { xstart, ystart, width, height, xbin, ybin }
    }
}

fn normalize_axis(bin: i32, start: i32, extent: i32, sensor: i64) -> (u32, u32, u32) {
    let bin = if bin <= 0 { 1 } else { bin as i64 };
    let mut start = start as i64;
    if start <= 0 || start >= sensor {
        start = 1;
    }
    start = (start - 1) / bin * bin + 1;

    let mut extent = extent as i64;
    if extent <= 0 || extent > sensor {
        extent = sensor;
    }
    let overhang = start + extent - 1 - sensor;
    if overhang > 0 {
        extent -= overhang;
    }
    extent -= extent % bin;
    if extent <= 0 {
        start = 1;
        extent = sensor - sensor % bin;
    }

    (start as u32, extent.max(0) as u32, bin as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_request_is_full_frame() {
        let roi = RoiRequest::default().normalize(4096, 4096);
        assert_eq!(roi, Roi::full(4096, 4096));
        assert_eq!(roi.image_bytes(), 33_554_432);
    }

    #[test]
    fn oversized_window_is_trimmed_to_sensor() {
        let request = RoiRequest { xstart: 1001, width: 4000, ..Default::default() };
        let roi = request.normalize(4096, 4096);
        assert_eq!(roi.xstart, 1001);
        assert_eq!(roi.width, 3096);
    }

    #[test]
    fn binning_aligns_start_and_extent() {
        let request =
            RoiRequest { xbin: 2, ybin: 3, xstart: 4, ystart: 5, width: 101, height: 100 };
        let roi = request.normalize(1024, 1024);
        assert_eq!((roi.xstart, roi.ystart), (3, 4));
        assert_eq!(roi.width, 100);
        assert_eq!(roi.height, 99);
        assert_eq!(roi.binned_width(), 50);
        assert_eq!(roi.binned_height(), 33);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let request = RoiRequest { xbin: 0, ybin: -2, xstart: 9000, ystart: -1, width: 0, height: 0 };
        let roi = request.normalize(2048, 1024);
        assert_eq!(roi, Roi::full(2048, 1024));
    }
}
