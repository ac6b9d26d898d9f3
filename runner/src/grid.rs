use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("Grid point {index} does not exist, grid holds {size} points")]
    UnknownPoint { index: u64, size: u64 },
    #[error("Refinement needs one score per grid point ({expected}), got {actual}")]
    ScoreLength { expected: u64, actual: usize },
    #[error("Grid topology is malformed: {0}")]
    Malformed(String),
    #[error("Failed to (de)serialize grid topology")]
    Serialize(#[from] serde_yaml::Error),
}

/// The grid the surrogate is built on.
///
/// Points are addressed by a sequence index which is stable for the lifetime of the grid:
/// refinement only ever appends.
pub trait Grid: Sized {
    fn size(&self) -> u64;

    fn dimension(&self) -> usize;

    fn coordinates_of(&self, index: u64) -> Result<Vec<f64>, GridError>;

    /// refine the `count` points with the highest scores, returns the number of added points
    fn refine(&mut self, scores: &[f64], count: usize) -> Result<u64, GridError>;

    fn serialize(&self) -> Result<String, GridError>;

    fn deserialize(blob: &str) -> Result<Self, GridError>;
}

// deepest level a grid point may have, 2^level has to fit the index type
const MAX_LEVEL: u32 = 30;

/// (level, index) per dimension, the index is odd and below `2^level`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Hash)]
struct GridPoint(Vec<(u32, u32)>);

impl GridPoint {
    fn children(&self) -> impl Iterator<Item = GridPoint> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, (level, _))| *level < MAX_LEVEL)
            .flat_map(move |(dim, (level, index))| {
                [2 * index - 1, 2 * index + 1].into_iter().map(move |child| {
                    let mut point = self.clone();
                    point.0[dim] = (level + 1, child);

                    point
                })
            })
    }
}

#[derive(Deserialize, Serialize, Debug)]
#[serde(deny_unknown_fields)]
struct Topology {
    bounds: Vec<(f64, f64)>,
    points: Vec<GridPoint>,
}

/// Hierarchical sparse grid without boundary points on a bounding box.
#[derive(Debug, Clone)]
pub struct SparseGrid {
    bounds: Vec<(f64, f64)>,
    points: Vec<GridPoint>,
    lookup: HashMap<GridPoint, u64>,
}

impl SparseGrid {
    /// regular sparse grid of `level`: every point with `sum(l_k - 1) < level`
    pub fn regular(level: u32, bounds: Vec<(f64, f64)>) -> Self {
        let dim = bounds.len();
        let mut grid = Self {
            bounds,
            points: Vec::new(),
            lookup: HashMap::new(),
        };

        for excess in 0..level.min(MAX_LEVEL) {
            for levels in level_vectors(dim, excess) {
                levels
                    .iter()
                    .map(|level| (0..1u32 << (level - 1)).map(|k| 2 * k + 1))
                    .multi_cartesian_product()
                    .for_each(|indices| {
                        grid.push(GridPoint(levels.iter().copied().zip(indices).collect()));
                    });
            }
        }

        debug!(level = level, dim = dim, points = grid.points.len(), "Created regular grid");

        grid
    }

    fn push(&mut self, point: GridPoint) -> bool {
        if self.lookup.contains_key(&point) {
            return false;
        }

        self.lookup.insert(point.clone(), self.points.len() as u64);
        self.points.push(point);

        true
    }

    fn is_refinable(&self, point: &GridPoint) -> bool {
        point.children().any(|child| !self.lookup.contains_key(&child))
    }
}

/// all level vectors of `dim` entries >= 1 whose entries sum up to `dim + excess`
fn level_vectors(dim: usize, excess: u32) -> Vec<Vec<u32>> {
    if dim == 0 {
        return if excess == 0 { vec![Vec::new()] } else { Vec::new() };
    }

    (0..=excess)
        .rev()
        .flat_map(|head| {
            level_vectors(dim - 1, excess - head)
                .into_iter()
                .map(move |mut tail| {
                    tail.insert(0, head + 1);
                    tail
                })
        })
        .collect()
}

impl Grid for SparseGrid {
    fn size(&self) -> u64 {
        self.points.len() as u64
    }

    fn dimension(&self) -> usize {
        self.bounds.len()
    }

    fn coordinates_of(&self, index: u64) -> Result<Vec<f64>, GridError> {
        let point = self
            .points
            .get(index as usize)
            .ok_or(GridError::UnknownPoint {
                index,
                size: self.size(),
            })?;

        Ok(point
            .0
            .iter()
            .zip(self.bounds.iter())
            .map(|((level, index), (min, max))| {
                min + (max - min) * f64::from(*index) / f64::from(1u32 << level)
            })
            .collect())
    }

    fn refine(&mut self, scores: &[f64], count: usize) -> Result<u64, GridError> {
        if scores.len() as u64 != self.size() {
            return Err(GridError::ScoreLength {
                expected: self.size(),
                actual: scores.len(),
            });
        }

        // NaN ranks below every other score
        let score = |index: usize| match scores[index] {
            score if score.is_nan() => f64::NEG_INFINITY,
            score => score,
        };

        // highest score first, ties resolved towards the lower index
        let chosen = (0..self.points.len())
            .filter(|index| self.is_refinable(&self.points[*index]))
            .sorted_by(|a, b| score(*b).total_cmp(&score(*a)).then(a.cmp(b)))
            .take(count)
            .collect_vec();

        let before = self.size();
        for index in chosen {
            let children = self.points[index].children().collect_vec();

            for child in children {
                self.push(child);
            }
        }

        debug!(added = self.size() - before, size = self.size(), "Refined grid");

        Ok(self.size() - before)
    }

    fn serialize(&self) -> Result<String, GridError> {
        Ok(serde_yaml::to_string(&Topology {
            bounds: self.bounds.clone(),
            points: self.points.clone(),
        })?)
    }

    fn deserialize(blob: &str) -> Result<Self, GridError> {
        let topology: Topology = serde_yaml::from_str(blob)?;
        let mut grid = Self {
            bounds: topology.bounds,
            points: Vec::with_capacity(topology.points.len()),
            lookup: HashMap::with_capacity(topology.points.len()),
        };

        for point in topology.points {
            if point.0.len() != grid.bounds.len() {
                return Err(GridError::Malformed(format!(
                    "point {:?} does not match dimension {}",
                    point.0,
                    grid.bounds.len()
                )));
            }

            if !grid.push(point) {
                return Err(GridError::Malformed("duplicate grid point".to_string()));
            }
        }

        Ok(grid)
    }
}
