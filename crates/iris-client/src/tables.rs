//! Structural table detection from ruling lines.
//!
//! Binarizes the image, projects ink density onto each axis, and treats
//! rows/columns whose ink coverage exceeds a threshold as ruling lines. A
//! grid of at least 2×2 cells is read out cell by cell through the OCR
//! engine and emitted as a pipe-delimited markdown table.

use image::{GrayImage, imageops};
use iris_core::error::AppError;
use iris_core::models::TableScan;
use iris_core::traits::{OcrEngine, TableDetector};

/// Tuning knobs for ruling-line detection.
#[derive(Debug, Clone)]
pub struct TableDetectConfig {
    /// Luma below this value counts as ink.
    pub ink_threshold: u8,

    /// Fraction of an axis a run of ink must span to count as a ruling
    /// line.
    pub line_coverage: f32,

    /// Pixels shaved off each cell edge so the rulings themselves are not
    /// fed to OCR.
    pub cell_margin: u32,
}

impl Default for TableDetectConfig {
    fn default() -> Self {
        Self {
            ink_threshold: 128,
            line_coverage: 0.6,
            cell_margin: 2,
        }
    }
}

/// Table detector that reads cells through the wrapped OCR engine.
#[derive(Debug, Clone)]
pub struct GridTableDetector<O> {
    ocr: O,
    config: TableDetectConfig,
}

impl<O: OcrEngine> GridTableDetector<O> {
    pub fn new(ocr: O) -> Self {
        Self::with_config(ocr, TableDetectConfig::default())
    }

    pub fn with_config(ocr: O, config: TableDetectConfig) -> Self {
        Self { ocr, config }
    }

    fn read_cells(
        &self,
        img: &image::DynamicImage,
        rows: &[u32],
        cols: &[u32],
    ) -> Result<Vec<Vec<String>>, AppError> {
        let margin = self.config.cell_margin;
        let mut grid = Vec::with_capacity(rows.len() - 1);
        for pair in rows.windows(2) {
            let (top, bottom) = (pair[0] + margin, pair[1].saturating_sub(margin));
            let mut row = Vec::with_capacity(cols.len() - 1);
            for cpair in cols.windows(2) {
                let (left, right) = (cpair[0] + margin, cpair[1].saturating_sub(margin));
                if right <= left || bottom <= top {
                    row.push(String::new());
                    continue;
                }
                let cell = imageops::crop_imm(img, left, top, right - left, bottom - top);
                let mut png = Vec::new();
                image::DynamicImage::ImageRgba8(cell.to_image())
                    .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
                    .map_err(|e| {
                        AppError::ExtractionFailed(format!("Failed to encode cell: {e}"))
                    })?;
                let text = self.ocr.recognize(&png)?;
                row.push(text.split_whitespace().collect::<Vec<_>>().join(" "));
            }
            grid.push(row);
        }
        Ok(grid)
    }
}

impl<O: OcrEngine> TableDetector for GridTableDetector<O> {
    fn detect(&self, image: &[u8]) -> Result<TableScan, AppError> {
        let img = image::load_from_memory(image)
            .map_err(|e| AppError::ExtractionFailed(format!("Failed to decode image: {e}")))?;
        let gray = img.to_luma8();

        let rows = ruling_lines(
            &row_ink_profile(&gray, self.config.ink_threshold),
            gray.width(),
            self.config.line_coverage,
        );
        let cols = ruling_lines(
            &column_ink_profile(&gray, self.config.ink_threshold),
            gray.height(),
            self.config.line_coverage,
        );

        // A 2×2 grid needs 3 rulings on each axis.
        if rows.len() < 3 || cols.len() < 3 {
            tracing::debug!(
                row_lines = rows.len(),
                col_lines = cols.len(),
                "No table grid found"
            );
            return Ok(TableScan::default());
        }

        let grid = self.read_cells(&img, &rows, &cols)?;
        tracing::info!(
            rows = grid.len(),
            cols = cols.len() - 1,
            "Table grid extracted"
        );
        Ok(TableScan {
            tables_found: 1,
            markdown: grid_to_markdown(&grid),
        })
    }
}

/// Ink pixel count per image row.
fn row_ink_profile(gray: &GrayImage, ink_threshold: u8) -> Vec<u32> {
    let mut profile = vec![0u32; gray.height() as usize];
    for (_, y, pixel) in gray.enumerate_pixels() {
        if pixel.0[0] < ink_threshold {
            profile[y as usize] += 1;
        }
    }
    profile
}

/// Ink pixel count per image column.
fn column_ink_profile(gray: &GrayImage, ink_threshold: u8) -> Vec<u32> {
    let mut profile = vec![0u32; gray.width() as usize];
    for (x, _, pixel) in gray.enumerate_pixels() {
        if pixel.0[0] < ink_threshold {
            profile[x as usize] += 1;
        }
    }
    profile
}

/// Positions of ruling lines in a projection profile.
///
/// Consecutive rows/columns over the coverage threshold collapse to the
/// run's midpoint, so a thick ruling counts once.
fn ruling_lines(profile: &[u32], axis_len: u32, coverage: f32) -> Vec<u32> {
    let needed = (axis_len as f32 * coverage) as u32;
    let mut lines = Vec::new();
    let mut run_start: Option<usize> = None;
    for (i, &ink) in profile.iter().enumerate() {
        if ink >= needed.max(1) {
            run_start.get_or_insert(i);
        } else if let Some(start) = run_start.take() {
            lines.push(((start + i - 1) / 2) as u32);
        }
    }
    if let Some(start) = run_start {
        lines.push(((start + profile.len() - 1) / 2) as u32);
    }
    lines
}

/// Render the cell grid as a pipe table, separator after the header row.
fn grid_to_markdown(grid: &[Vec<String>]) -> String {
    let mut out = String::new();
    for (i, row) in grid.iter().enumerate() {
        out.push_str("| ");
        out.push_str(&row.join(" | "));
        out.push_str(" |\n");
        if i == 0 {
            out.push_str("|");
            for _ in row {
                out.push_str(" --- |");
            }
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_core::testutil::MockOcr;

    /// White canvas with a black-ruled `rows`×`cols` grid drawn on it.
    fn grid_png(rows: u32, cols: u32) -> Vec<u8> {
        let (w, h) = (40 * cols + 1, 30 * rows + 1);
        let mut img = GrayImage::from_pixel(w, h, image::Luma([255]));
        for y in 0..h {
            for x in 0..w {
                if x % 40 == 0 || y % 30 == 0 {
                    img.put_pixel(x, y, image::Luma([0]));
                }
            }
        }
        let mut png = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        png
    }

    fn blank_png(w: u32, h: u32) -> Vec<u8> {
        let img = GrayImage::from_pixel(w, h, image::Luma([255]));
        let mut png = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        png
    }

    #[test]
    fn blank_image_finds_no_table() {
        let detector = GridTableDetector::new(MockOcr::new("ignored"));
        let scan = detector.detect(&blank_png(120, 90)).unwrap();
        assert_eq!(scan.tables_found, 0);
        assert!(scan.markdown.is_empty());
    }

    #[test]
    fn ruled_grid_is_detected_and_read_out() {
        let detector = GridTableDetector::new(MockOcr::new("cell"));
        let scan = detector.detect(&grid_png(3, 2)).unwrap();
        assert_eq!(scan.tables_found, 1);
        let lines: Vec<&str> = scan.markdown.lines().collect();
        // 3 data rows plus the separator after the header.
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "| cell | cell |");
        assert_eq!(lines[1], "| --- | --- |");
    }

    #[test]
    fn ocr_failure_inside_a_cell_propagates() {
        let detector = GridTableDetector::new(MockOcr::with_error("engine down"));
        let err = detector.detect(&grid_png(2, 2)).unwrap_err();
        assert!(matches!(err, AppError::ExtractionFailed(_)));
    }

    #[test]
    fn undecodable_bytes_report_extraction_failure() {
        let detector = GridTableDetector::new(MockOcr::new("x"));
        let err = detector.detect(b"not an image").unwrap_err();
        assert!(matches!(err, AppError::ExtractionFailed(_)));
    }

    #[test]
    fn ruling_lines_collapse_thick_runs() {
        // Axis of length 10, coverage 0.5 ⇒ need 5 ink pixels.
        let profile = vec![0, 6, 7, 6, 0, 0, 8, 0, 0, 9];
        let lines = ruling_lines(&profile, 10, 0.5);
        assert_eq!(lines, vec![2, 6, 9]);
    }

    #[test]
    fn grid_to_markdown_places_separator_after_header() {
        let grid = vec![
            vec!["Name".to_string(), "Qty".to_string()],
            vec!["Bolt".to_string(), "40".to_string()],
        ];
        assert_eq!(
            grid_to_markdown(&grid),
            "| Name | Qty |\n| --- | --- |\n| Bolt | 40 |\n"
        );
    }
}
