use super::{CalibrationBoard, Detection, DetectionRow};
use crate::config::BoardConfig;
use crate::frame::Frame;

/// A `rows` x `cols` grid of bright markers, one centered in each cell.
///
/// A marker's id is its cell index in row-major order; its image position is
/// the centroid of the pixels at or above the threshold inside the cell.
#[derive(Debug, Clone)]
pub struct GridBoard {
    config: BoardConfig,
}

impl GridBoard {
    pub fn new(config: BoardConfig) -> Self {
        Self { config }
    }

    pub fn markers(&self) -> usize {
        (self.config.rows * self.config.cols) as usize
    }

    /// Board coordinates of a marker, or `None` for an unknown id.
    pub fn object_point(&self, id: u32) -> Option<[f64; 3]> {
        if id as usize >= self.markers() {
            return None;
        }
        let row = id / self.config.cols;
        let col = id % self.config.cols;
        let sq = self.config.square_length;
        Some([col as f64 * sq, row as f64 * sq, 0.0])
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Accum {
    sx: f64,
    sy: f64,
    n: u64,
}

impl CalibrationBoard for GridBoard {
    fn detect_image(&self, frame: &Frame) -> Option<Detection> {
        let (rows, cols) = (self.config.rows, self.config.cols);
        if frame.width < cols || frame.height < rows {
            return None;
        }
        let mut cells = vec![Accum::default(); self.markers()];
        for y in 0..frame.height {
            let r = (y as u64 * rows as u64 / frame.height as u64) as u32;
            for x in 0..frame.width {
                if frame.luma(x, y)? < self.config.threshold {
                    continue;
                }
                let c = (x as u64 * cols as u64 / frame.width as u64) as u32;
                let cell = &mut cells[(r * cols + c) as usize];
                cell.sx += x as f64;
                cell.sy += y as f64;
                cell.n += 1;
            }
        }

        let mut detection = Detection {
            corners: Vec::new(),
            ids: Vec::new(),
        };
        for (id, cell) in cells.iter().enumerate().filter(|(_, c)| c.n > 0) {
            detection.corners.push([cell.sx / cell.n as f64, cell.sy / cell.n as f64]);
            detection.ids.push(id as u32);
        }
        (detection.ids.len() >= self.config.min_markers.max(1)).then_some(detection)
    }

    fn fill_points_rows(&self, rows: &mut [DetectionRow]) {
        for row in rows {
            row.object_points = row
                .ids
                .iter()
                .map(|&id| self.object_point(id).unwrap_or([f64::NAN; 3]))
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraDevice, SimulatedCamera};
    use crate::frame::PixelFormat;

    fn board() -> GridBoard {
        GridBoard::new(BoardConfig {
            rows: 3,
            cols: 4,
            ..Default::default()
        })
    }

    #[test]
    fn test_detects_simulated_markers() {
        let mut camera = SimulatedCamera::new(0, 80, 60).with_markers(3, 4);
        let frame = camera.get_image().unwrap();
        let detection = board().detect_image(&frame).unwrap();
        assert_eq!(detection.ids, (0..12).collect::<Vec<u32>>());
        // marker of cell (row 1, col 2) sits near (50, 30)
        let [x, y] = detection.corners[6];
        assert!((x - 50.0).abs() <= 1.5 && (y - 30.0).abs() <= 1.5, "{} {}", x, y);
    }

    #[test]
    fn test_blank_frame_is_a_miss() {
        let frame = Frame::new(80, 60, PixelFormat::Mono8);
        assert!(board().detect_image(&frame).is_none());
    }

    #[test]
    fn test_fill_points_rows() {
        let mut rows = vec![DetectionRow::new(
            0,
            0,
            0.0,
            Detection {
                corners: vec![[0.0, 0.0], [1.0, 1.0]],
                ids: vec![0, 6],
            },
        )];
        board().fill_points_rows(&mut rows);
        assert_eq!(rows[0].object_points, vec![[0.0, 0.0, 0.0], [2.0, 1.0, 0.0]]);
    }
}
