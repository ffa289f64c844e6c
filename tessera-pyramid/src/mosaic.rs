//! Mosaics and pyramids: the multi-resolution tile grid model.
//!
//! A mosaic is one zoom level of a tiled data source: a grid of fixed-size
//! tiles anchored at a geographic upper-left origin, rows growing downward.
//! A pyramid set collects the mosaics of one source from coarsest to
//! finest and is the unit a tile cache is shared across.

use serde::{Deserialize, Serialize};

use tessera_spatial::Envelope;

use crate::error::{PyramidError, PyramidResult};

/// Tile dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileSize {
    pub width: u32,
    pub height: u32,
}

impl TileSize {
    pub fn new(width: u32, height: u32) -> TileSize {
        TileSize { width, height }
    }

    /// The ubiquitous 256 x 256 tile
    pub fn square_256() -> TileSize {
        TileSize::new(256, 256)
    }
}

/// Inclusive tile coordinate ranges of a mosaic region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRange {
    pub min_col: u32,
    pub max_col: u32,
    pub min_row: u32,
    pub max_row: u32,
}

impl TileRange {
    /// Iterates the (col, row) pairs of the range in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (self.min_row..=self.max_row)
            .flat_map(move |row| (self.min_col..=self.max_col).map(move |col| (col, row)))
    }

    pub fn len(&self) -> usize {
        let cols = (self.max_col - self.min_col + 1) as usize;
        let rows = (self.max_row - self.min_row + 1) as usize;
        cols * rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One resolution level of a tiled pyramid.
///
/// Tile `(col, row)` maps deterministically to a geographic envelope from
/// the upper-left origin, the tile pixel size and the scale (geographic
/// units per pixel); row 0 is the topmost row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mosaic {
    id: String,
    columns: u32,
    rows: u32,
    tile_size: TileSize,
    upper_left: (f64, f64),
    scale: f64,
}

impl Mosaic {
    pub fn new(
        id: impl Into<String>,
        columns: u32,
        rows: u32,
        tile_size: TileSize,
        upper_left: (f64, f64),
        scale: f64,
    ) -> PyramidResult<Mosaic> {
        let id = id.into();
        if columns == 0 || rows == 0 {
            return Err(PyramidError::InvalidArgument(format!(
                "mosaic {} has an empty grid: {}x{}",
                id, columns, rows
            )));
        }
        if tile_size.width == 0 || tile_size.height == 0 {
            return Err(PyramidError::InvalidArgument(format!(
                "mosaic {} has an empty tile size",
                id
            )));
        }
        if !scale.is_finite() || scale <= 0.0 {
            return Err(PyramidError::InvalidArgument(format!(
                "mosaic {} has invalid scale {}",
                id, scale
            )));
        }
        if !upper_left.0.is_finite() || !upper_left.1.is_finite() {
            return Err(PyramidError::InvalidArgument(format!(
                "mosaic {} has a non-finite origin",
                id
            )));
        }
        Ok(Mosaic {
            id,
            columns,
            rows,
            tile_size,
            upper_left,
            scale,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn tile_size(&self) -> TileSize {
        self.tile_size
    }

    pub fn upper_left(&self) -> (f64, f64) {
        self.upper_left
    }

    /// Geographic units per pixel at this level.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Geographic width of one tile.
    pub fn tile_geo_width(&self) -> f64 {
        self.tile_size.width as f64 * self.scale
    }

    /// Geographic height of one tile.
    pub fn tile_geo_height(&self) -> f64 {
        self.tile_size.height as f64 * self.scale
    }

    fn check_coordinate(&self, col: u32, row: u32) -> PyramidResult<()> {
        if col >= self.columns || row >= self.rows {
            return Err(PyramidError::InvalidArgument(format!(
                "tile {}x{} outside the {}x{} grid of mosaic {}",
                col, row, self.columns, self.rows, self.id
            )));
        }
        Ok(())
    }

    /// Geographic envelope of tile `(col, row)`.
    ///
    /// The origin is the upper-left corner and rows grow downward, so
    /// `min_y` drops by one tile height per row.
    pub fn tile_envelope(&self, col: u32, row: u32) -> PyramidResult<Envelope> {
        self.check_coordinate(col, row)?;
        let (origin_x, origin_y) = self.upper_left;
        let w = self.tile_geo_width();
        let h = self.tile_geo_height();
        let min_x = origin_x + col as f64 * w;
        let min_y = origin_y - (row as f64 + 1.0) * h;
        let envelope = Envelope::new(vec![min_x, min_y], vec![min_x + w, min_y + h])?;
        Ok(envelope)
    }

    /// Geographic envelope of the whole level.
    pub fn envelope(&self) -> Envelope {
        let (origin_x, origin_y) = self.upper_left;
        let w = self.tile_geo_width();
        let h = self.tile_geo_height();
        let min_y = origin_y - self.rows as f64 * h;
        let max_x = origin_x + self.columns as f64 * w;
        Envelope::new(vec![origin_x, min_y], vec![max_x, origin_y])
            .expect("grid extents are validated at construction")
    }

    /// The tile coordinate range intersecting `query`, or `None` when the
    /// query misses this level entirely.
    pub fn tiles_in(&self, query: &Envelope) -> PyramidResult<Option<TileRange>> {
        if query.dimension() != 2 {
            return Err(PyramidError::InvalidArgument(format!(
                "tile queries are 2-dimensional, got dimension {}",
                query.dimension()
            )));
        }
        if !self.envelope().intersects(query) {
            return Ok(None);
        }
        let (origin_x, origin_y) = self.upper_left;
        let w = self.tile_geo_width();
        let h = self.tile_geo_height();
        let min_col = ((query.lower(0) - origin_x) / w).floor().max(0.0) as u32;
        let max_col = (((query.upper(0) - origin_x) / w).floor() as i64)
            .clamp(0, self.columns as i64 - 1) as u32;
        let min_row = ((origin_y - query.upper(1)) / h).floor().max(0.0) as u32;
        let max_row = (((origin_y - query.lower(1)) / h).floor() as i64)
            .clamp(0, self.rows as i64 - 1) as u32;
        Ok(Some(TileRange {
            min_col: min_col.min(self.columns - 1),
            max_col,
            min_row: min_row.min(self.rows - 1),
            max_row,
        }))
    }
}

/// The ordered mosaics of one tiled data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PyramidSet {
    id: String,
    /// Mime type of the tile payloads, handed to the fetch collaborator
    format: String,
    /// Coarsest (largest scale) first
    mosaics: Vec<Mosaic>,
}

impl PyramidSet {
    pub fn new(
        id: impl Into<String>,
        format: impl Into<String>,
        mut mosaics: Vec<Mosaic>,
    ) -> PyramidResult<PyramidSet> {
        let id = id.into();
        for i in 0..mosaics.len() {
            for j in (i + 1)..mosaics.len() {
                if mosaics[i].id() == mosaics[j].id() {
                    return Err(PyramidError::InvalidArgument(format!(
                        "duplicate mosaic id {} in pyramid {}",
                        mosaics[i].id(),
                        id
                    )));
                }
            }
        }
        mosaics.sort_by(|a, b| {
            b.scale()
                .partial_cmp(&a.scale())
                .expect("scales are validated finite")
        });
        Ok(PyramidSet {
            id,
            format: format.into(),
            mosaics,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    /// Mosaics ordered from coarsest to finest.
    pub fn mosaics(&self) -> &[Mosaic] {
        &self.mosaics
    }

    pub fn mosaic(&self, id: &str) -> Option<&Mosaic> {
        self.mosaics.iter().find(|m| m.id() == id)
    }

    /// The level whose resolution is closest to the requested scale.
    pub fn best_mosaic_for_scale(&self, scale: f64) -> Option<&Mosaic> {
        self.mosaics.iter().min_by(|a, b| {
            let da = (a.scale() - scale).abs();
            let db = (b.scale() - scale).abs();
            da.partial_cmp(&db).expect("scales are validated finite")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web_mercator_level(id: &str, side: u32, scale: f64) -> Mosaic {
        Mosaic::new(
            id,
            side,
            side,
            TileSize::square_256(),
            (-180.0, 85.0511),
            scale,
        )
        .unwrap()
    }

    #[test]
    fn test_tile_zero_upper_left_is_origin() {
        let scale = 0.005;
        let mosaic = web_mercator_level("L0", 4, scale);
        let envelope = mosaic.tile_envelope(0, 0).unwrap();
        assert_eq!(envelope.lower(0), -180.0);
        assert_eq!(envelope.upper(1), 85.0511);
        assert_eq!(envelope.upper(0), -180.0 + 256.0 * scale);
    }

    #[test]
    fn test_tile_envelope_mapping() {
        let mosaic = Mosaic::new("L1", 8, 8, TileSize::new(100, 50), (0.0, 100.0), 0.1).unwrap();
        // Geographic tile size: 10 x 5
        let envelope = mosaic.tile_envelope(2, 3).unwrap();
        assert_eq!(envelope.lower(0), 20.0);
        assert_eq!(envelope.upper(0), 30.0);
        assert_eq!(envelope.upper(1), 100.0 - 3.0 * 5.0);
        assert_eq!(envelope.lower(1), 100.0 - 4.0 * 5.0);
    }

    #[test]
    fn test_tile_envelope_rejects_out_of_grid() {
        let mosaic = web_mercator_level("L0", 4, 0.01);
        assert!(mosaic.tile_envelope(4, 0).is_err());
        assert!(mosaic.tile_envelope(0, 4).is_err());
    }

    #[test]
    fn test_level_envelope_covers_all_tiles() {
        let mosaic = Mosaic::new("L2", 3, 2, TileSize::new(10, 10), (0.0, 20.0), 1.0).unwrap();
        let level = mosaic.envelope();
        for row in 0..2 {
            for col in 0..3 {
                assert!(level.contains(&mosaic.tile_envelope(col, row).unwrap()));
            }
        }
        assert_eq!(level.lower(1), 0.0);
        assert_eq!(level.upper(0), 30.0);
    }

    #[test]
    fn test_invalid_mosaics_rejected() {
        let size = TileSize::square_256();
        assert!(Mosaic::new("a", 0, 4, size, (0.0, 0.0), 1.0).is_err());
        assert!(Mosaic::new("b", 4, 4, TileSize::new(0, 256), (0.0, 0.0), 1.0).is_err());
        assert!(Mosaic::new("c", 4, 4, size, (0.0, 0.0), 0.0).is_err());
        assert!(Mosaic::new("d", 4, 4, size, (0.0, 0.0), -2.0).is_err());
        assert!(Mosaic::new("e", 4, 4, size, (f64::NAN, 0.0), 1.0).is_err());
    }

    #[test]
    fn test_tiles_in_clips_to_grid() {
        let mosaic = Mosaic::new("L3", 4, 4, TileSize::new(10, 10), (0.0, 40.0), 1.0).unwrap();
        // Query hanging over the right edge
        let query = Envelope::new(vec![25.0, 15.0], vec![100.0, 32.0]).unwrap();
        let range = mosaic.tiles_in(&query).unwrap().unwrap();
        assert_eq!(range.min_col, 2);
        assert_eq!(range.max_col, 3);
        assert_eq!(range.min_row, 0);
        assert_eq!(range.max_row, 2);
        assert_eq!(range.len(), 6);

        // Fully outside
        let outside = Envelope::new(vec![500.0, 500.0], vec![600.0, 600.0]).unwrap();
        assert!(mosaic.tiles_in(&outside).unwrap().is_none());
    }

    #[test]
    fn test_tiles_in_range_matches_envelopes() {
        let mosaic = Mosaic::new("L4", 6, 6, TileSize::new(10, 10), (0.0, 60.0), 1.0).unwrap();
        let query = Envelope::new(vec![12.0, 12.0], vec![38.0, 47.0]).unwrap();
        let range = mosaic.tiles_in(&query).unwrap().unwrap();
        for (col, row) in range.iter() {
            assert!(
                mosaic.tile_envelope(col, row).unwrap().intersects(&query),
                "tile {}x{} should intersect the query",
                col,
                row
            );
        }
    }

    #[test]
    fn test_pyramid_orders_by_scale() {
        let fine = web_mercator_level("fine", 16, 0.001);
        let coarse = web_mercator_level("coarse", 4, 0.01);
        let mid = web_mercator_level("mid", 8, 0.005);
        let pyramid = PyramidSet::new("osm", "image/png", vec![fine, coarse, mid]).unwrap();
        let ids: Vec<&str> = pyramid.mosaics().iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec!["coarse", "mid", "fine"]);
    }

    #[test]
    fn test_pyramid_rejects_duplicate_ids() {
        let a = web_mercator_level("L0", 4, 0.01);
        let b = web_mercator_level("L0", 8, 0.005);
        assert!(PyramidSet::new("p", "image/png", vec![a, b]).is_err());
    }

    #[test]
    fn test_best_mosaic_for_scale() {
        let pyramid = PyramidSet::new(
            "osm",
            "image/png",
            vec![
                web_mercator_level("L0", 4, 0.01),
                web_mercator_level("L1", 8, 0.005),
                web_mercator_level("L2", 16, 0.001),
            ],
        )
        .unwrap();
        assert_eq!(pyramid.best_mosaic_for_scale(0.004).unwrap().id(), "L1");
        assert_eq!(pyramid.best_mosaic_for_scale(1.0).unwrap().id(), "L0");
        assert_eq!(pyramid.best_mosaic_for_scale(0.0).unwrap().id(), "L2");
    }

    #[test]
    fn test_mosaic_lookup() {
        let pyramid = PyramidSet::new(
            "osm",
            "image/png",
            vec![web_mercator_level("L0", 4, 0.01)],
        )
        .unwrap();
        assert!(pyramid.mosaic("L0").is_some());
        assert!(pyramid.mosaic("L9").is_none());
    }
}
