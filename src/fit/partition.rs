//! Static assignment of regions to worker groups.
//!
//! Regions are cut into contiguous groups so that each group holds roughly the
//! same number of observations (not regions). The result depends only on the
//! per-region row counts and the group count.

use std::ops::Range;

use log::trace;

/// One worker's share of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Region indices.
    pub regions: Range<usize>,
    /// Rows of the global residual vector.
    pub rows: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    groups: Vec<Group>,
}

impl Partition {
    /// Split regions with the given row counts into at most `n_groups` groups.
    ///
    /// Never produces empty groups; fewer groups are returned when there are
    /// fewer regions than requested groups.
    pub fn balanced(rows_per_region: &[usize], n_groups: usize) -> Self {
        let n = rows_per_region.len();
        let k = n_groups.min(n).max(1);
        let total: usize = rows_per_region.iter().sum();

        let mut groups = Vec::with_capacity(k);
        let mut start = 0;
        let mut row_start = 0;
        for g in 0..k {
            let end = if g + 1 == k {
                n
            } else {
                let target = total as f64 * (g + 1) as f64 / k as f64;
                // Leave at least one region for each remaining group.
                let last_allowed = n - (k - g - 1);
                let mut end = start + 1;
                let mut acc = row_start + rows_per_region[start];
                while end < last_allowed && (acc as f64 + rows_per_region[end] as f64 / 2.0) < target {
                    acc += rows_per_region[end];
                    end += 1;
                }
                end
            };
            let row_end = row_start + rows_per_region[start..end].iter().sum::<usize>();
            groups.push(Group {
                regions: start..end,
                rows: row_start..row_end,
            });
            start = end;
            row_start = row_end;
        }

        for (i, g) in groups.iter().enumerate() {
            trace!("group {i}: regions {:?}, rows {:?}", g.regions, g.rows);
        }
        Self { groups }
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covers(p: &Partition, rows: &[usize]) {
        let mut region = 0;
        let mut row = 0;
        for g in p.groups() {
            assert_eq!(g.regions.start, region);
            assert_eq!(g.rows.start, row);
            assert!(!g.regions.is_empty());
            region = g.regions.end;
            row = g.rows.end;
        }
        assert_eq!(region, rows.len());
        assert_eq!(row, rows.iter().sum::<usize>());
    }

    #[test]
    fn equal_regions_split_evenly() {
        let rows = vec![100; 12];
        let p = Partition::balanced(&rows, 4);
        covers(&p, &rows);
        assert!(p.groups().iter().all(|g| g.regions.len() == 3));
    }

    #[test]
    fn balance_is_by_rows_not_regions() {
        let rows = vec![900, 100, 100, 100, 100, 100, 100, 100, 100, 100];
        let p = Partition::balanced(&rows, 2);
        covers(&p, &rows);
        assert_eq!(p.groups()[0].regions, 0..1);
        assert_eq!(p.groups()[1].rows.len(), 900);
    }

    #[test]
    fn more_groups_than_regions() {
        let rows = vec![10, 10, 10];
        let p = Partition::balanced(&rows, 8);
        covers(&p, &rows);
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn single_group_takes_everything() {
        let rows = vec![5, 7, 9];
        let p = Partition::balanced(&rows, 1);
        assert_eq!(p.groups(), &[Group { regions: 0..3, rows: 0..21 }]);
    }

    #[test]
    fn partition_is_deterministic() {
        let rows: Vec<usize> = (0..50).map(|i| 50 + (i * 37) % 23).collect();
        assert_eq!(Partition::balanced(&rows, 6), Partition::balanced(&rows, 6));
        covers(&Partition::balanced(&rows, 6), &rows);
    }
}
