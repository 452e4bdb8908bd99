//! Spatial layout of the outputs on the detector
//!
//! The 16 outputs of the GLINT chip are dispersed into 16 horizontal tracks.
//! A [TrackLayout] gives the nominal spatial position of each track and
//! the separation between them, and cuts a detector image into per-track,
//! per-spectral channel profiles.

use std::ops::Range;

use crate::frames::Image;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum TrackError {
    #[error("a layout needs at least 2 tracks, found {0}")]
    TooFewTracks(usize),
    #[error("track positions must be finite and strictly increasing")]
    Unsorted,
    #[error("the track separation must be positive, found {0}")]
    Separation(f64),
    #[error("{labels} labels for {tracks} tracks")]
    Labels { labels: usize, tracks: usize },
    #[error("track #{track} at row {position} is outside the detector ({n_spatial} rows)")]
    OutOfDetector {
        track: usize,
        position: f64,
        n_spatial: usize,
    },
    #[error("{profiles} profiles for {n_channels} channels x {n_tracks} tracks")]
    Profiles {
        profiles: usize,
        n_channels: usize,
        n_tracks: usize,
    },
}
type Result<T> = std::result::Result<T, TrackError>;

/// Output labels of the 16 tracks, from the top to the bottom of the detector
pub const GLINT_LABELS: [&str; 16] = [
    "P4", "N3", "P3", "N2", "AN4", "N5", "N4", "AN5", "N6", "AN1", "AN6", "N1", "AN2", "P2", "AN3",
    "P1",
];
/// Rows of the top-most and bottom-most tracks
pub const GLINT_TRACK_ENDS: (f64, f64) = (33., 329.);

fn evenly_spaced(top: f64, bottom: f64, n_tracks: usize) -> (Vec<f64>, f64) {
    let separation = (bottom - top) / (n_tracks as f64 - 1.);
    let positions = (0..n_tracks)
        .map(|k| (top + k as f64 * separation).round_ties_even())
        .collect();
    (positions, separation)
}

/// Nominal track positions, separation and labels
#[derive(Debug, Clone, PartialEq)]
pub struct TrackLayout {
    positions: Vec<f64>,
    separation: f64,
    labels: Vec<String>,
}
impl Default for TrackLayout {
    /// The GLINT layout: 16 tracks evenly spread between rows 33 and 329
    fn default() -> Self {
        let (top, bottom) = GLINT_TRACK_ENDS;
        let (positions, separation) = evenly_spaced(top, bottom, GLINT_LABELS.len());
        Self {
            positions,
            separation,
            labels: GLINT_LABELS.iter().map(|l| l.to_string()).collect(),
        }
    }
}
impl TrackLayout {
    pub fn new(positions: Vec<f64>, separation: f64, labels: Vec<String>) -> Result<Self> {
        if positions.len() < 2 {
            return Err(TrackError::TooFewTracks(positions.len()));
        }
        if positions.iter().any(|p| !p.is_finite()) || positions.windows(2).any(|w| w[0] >= w[1])
        {
            return Err(TrackError::Unsorted);
        }
        if !(separation.is_finite() && separation > 0.) {
            return Err(TrackError::Separation(separation));
        }
        if labels.len() != positions.len() {
            return Err(TrackError::Labels {
                labels: labels.len(),
                tracks: positions.len(),
            });
        }
        Ok(Self {
            positions,
            separation,
            labels,
        })
    }
    /// `n_tracks` tracks evenly spread between the rows `top` and `bottom`
    ///
    /// Positions are rounded to the nearest row and the tracks are labelled `T1`, `T2`, ...
    pub fn from_ends(top: f64, bottom: f64, n_tracks: usize) -> Result<Self> {
        if n_tracks < 2 {
            return Err(TrackError::TooFewTracks(n_tracks));
        }
        let (positions, separation) = evenly_spaced(top, bottom, n_tracks);
        let labels = (1..=n_tracks).map(|k| format!("T{k}")).collect();
        Self::new(positions, separation, labels)
    }
    /// Replaces the track labels
    pub fn with_labels<S: ToString>(self, labels: &[S]) -> Result<Self> {
        Self::new(
            self.positions,
            self.separation,
            labels.iter().map(|l| l.to_string()).collect(),
        )
    }
    pub fn n_tracks(&self) -> usize {
        self.positions.len()
    }
    pub fn positions(&self) -> &[f64] {
        &self.positions
    }
    pub fn position(&self, track: usize) -> f64 {
        self.positions[track]
    }
    pub fn separation(&self) -> f64 {
        self.separation
    }
    pub fn labels(&self) -> &[String] {
        &self.labels
    }
    pub fn label(&self, track: usize) -> &str {
        &self.labels[track]
    }
    /// Half width of a track window in rows
    pub fn half_width(&self) -> usize {
        (self.separation / 2.).floor() as usize
    }
    /// The detector rows of a track window, clipped to the detector
    pub fn window(&self, track: usize, n_spatial: usize) -> Result<Range<usize>> {
        let position = self.positions[track];
        let center = position.round();
        if center < 0. || center >= n_spatial as f64 {
            return Err(TrackError::OutOfDetector {
                track,
                position,
                n_spatial,
            });
        }
        let center = center as usize;
        let h = self.half_width();
        Ok(center.saturating_sub(h)..(center + h + 1).min(n_spatial))
    }
    /// Cuts the image into the cross-track profiles of every spectral channel
    pub fn slices(&self, image: &Image) -> Result<TrackSlices> {
        let (n_spatial, n_channels) = image.shape();
        let windows = (0..self.n_tracks())
            .map(|track| self.window(track, n_spatial))
            .collect::<Result<Vec<_>>>()?;
        let axes = windows
            .iter()
            .map(|rows| rows.clone().map(|row| row as f64).collect())
            .collect();
        let profiles = (0..n_channels)
            .flat_map(|channel| {
                windows
                    .iter()
                    .map(move |rows| rows.clone().map(|row| image.get(row, channel)).collect())
            })
            .collect();
        TrackSlices::new(n_channels, axes, profiles)
    }
}

/// Cross-track intensity profiles for every (spectral channel, track) pair
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSlices {
    n_channels: usize,
    axes: Vec<Vec<f64>>,
    profiles: Vec<Vec<f64>>,
}
impl TrackSlices {
    /// Creates the slices from the spatial `axes` of the tracks and the
    /// `profiles` ordered by channel first, then by track
    pub fn new(n_channels: usize, axes: Vec<Vec<f64>>, profiles: Vec<Vec<f64>>) -> Result<Self> {
        if profiles.len() != n_channels * axes.len() {
            return Err(TrackError::Profiles {
                profiles: profiles.len(),
                n_channels,
                n_tracks: axes.len(),
            });
        }
        Ok(Self {
            n_channels,
            axes,
            profiles,
        })
    }
    pub fn n_channels(&self) -> usize {
        self.n_channels
    }
    pub fn n_tracks(&self) -> usize {
        self.axes.len()
    }
    /// Spatial coordinates of the track window
    pub fn axis(&self, track: usize) -> &[f64] {
        &self.axes[track]
    }
    pub fn profile(&self, channel: usize, track: usize) -> &[f64] {
        &self.profiles[channel * self.axes.len() + track]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glint_layout() {
        let layout = TrackLayout::default();
        assert_eq!(layout.n_tracks(), 16);
        assert!((layout.separation() - 296. / 15.).abs() < 1e-12);
        assert_eq!(layout.position(0), 33.);
        assert_eq!(layout.position(1), 53.);
        assert_eq!(layout.position(15), 329.);
        assert_eq!(layout.half_width(), 9);
        assert_eq!(layout.label(15), "P1");
    }

    #[test]
    fn layout_validation() {
        assert_eq!(
            TrackLayout::from_ends(10., 20., 1),
            Err(TrackError::TooFewTracks(1))
        );
        assert_eq!(
            TrackLayout::new(vec![2., 1.], 1., vec!["a".into(), "b".into()]),
            Err(TrackError::Unsorted)
        );
        assert!(matches!(
            TrackLayout::from_ends(0., 10., 3).unwrap().with_labels(&["a"]),
            Err(TrackError::Labels { .. })
        ));
    }

    #[test]
    fn windows_are_clipped() {
        let layout = TrackLayout::from_ends(1., 9., 3).unwrap();
        assert_eq!(layout.separation(), 4.);
        assert_eq!(layout.window(0, 10).unwrap(), 0..4);
        assert_eq!(layout.window(1, 10).unwrap(), 3..8);
        assert_eq!(layout.window(2, 10).unwrap(), 7..10);
        assert!(matches!(
            layout.window(2, 9),
            Err(TrackError::OutOfDetector { track: 2, .. })
        ));
    }

    #[test]
    fn slicing_an_image() {
        let (n_spatial, n_spectral) = (10, 3);
        let data = (0..n_spatial * n_spectral).map(|x| x as f64).collect();
        let image = Image::new(n_spatial, n_spectral, data).unwrap();
        let layout = TrackLayout::from_ends(2., 7., 2).unwrap();
        let slices = layout.slices(&image).unwrap();
        assert_eq!(slices.n_channels(), 3);
        assert_eq!(slices.n_tracks(), 2);
        assert_eq!(slices.axis(0), &[0., 1., 2., 3., 4.]);
        assert_eq!(slices.axis(1), &[5., 6., 7., 8., 9.]);
        assert_eq!(slices.profile(1, 0), &[1., 4., 7., 10., 13.]);
        assert_eq!(slices.profile(2, 1), &[17., 20., 23., 26., 29.]);
    }
}
