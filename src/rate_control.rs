//! Post-compression rate-distortion optimisation (PCRD-opt).
//!
//! Every coded pass contributes a (rate, distortion) point; per block the
//! convex hull of those points yields truncation candidates with
//! decreasing distortion-rate slopes. Layer allocation walks the merged
//! slope order (equivalent to thresholding a Lagrange multiplier) until
//! each layer's byte budget is met. Layers are cumulative by
//! construction: a bigger budget extends the same slope-ordered prefix.

use crate::bit_plane_coder::CodedBlock;

/// Rate-control input for one code-block.
pub struct BlockRateInput<'a> {
    pub coded: &'a CodedBlock,
    /// Distortion weight of the block's subband (norm-based synthesis
    /// gain estimate).
    pub weight: f64,
}

/// Cumulative pass counts per layer for one block.
pub type LayerAllocation = Vec<usize>;

struct HullPoint {
    passes: usize,
    rate: usize,
    dist: f64,
    /// Distortion reduction per byte relative to the previous hull point.
    slope: f64,
}

fn slope_between(from_rate: usize, from_dist: f64, to_rate: usize, to_dist: f64, weight: f64) -> f64 {
    let d_dist = (from_dist - to_dist) * weight;
    if to_rate == from_rate {
        if d_dist > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        d_dist / (to_rate - from_rate) as f64
    }
}

/// Upper-left convex hull of the block's truncation points, slopes
/// strictly decreasing along the hull.
fn convex_hull(input: &BlockRateInput<'_>) -> Vec<HullPoint> {
    let base = (0usize, input.coded.initial_distortion);
    let mut hull: Vec<HullPoint> = Vec::new();
    let mut rate_acc = 0usize;
    for (i, pass) in input.coded.passes.iter().enumerate() {
        rate_acc += pass.data.len();
        let dist = pass.distortion_after;
        loop {
            let (prev_rate, prev_dist) = hull
                .last()
                .map(|p| (p.rate, p.dist))
                .unwrap_or(base);
            let slope = slope_between(prev_rate, prev_dist, rate_acc, dist, input.weight);
            match hull.last() {
                Some(prev) if slope >= prev.slope => {
                    hull.pop();
                }
                _ => {
                    if slope > 0.0 {
                        hull.push(HullPoint {
                            passes: i + 1,
                            rate: rate_acc,
                            dist,
                            slope,
                        });
                    }
                    break;
                }
            }
        }
    }
    hull
}

/// Allocates coding passes of all blocks to `layers` cumulative layers.
///
/// `byte_target` bounds the cumulative Tier-1 byte count of the final
/// layer (packet header overhead is not modelled). Without a target every
/// pass lands in the final layer and earlier layers split the total rate
/// evenly. In strict mode a layer never exceeds its budget; otherwise the
/// pass crossing the boundary is still admitted.
pub fn allocate_layers(
    blocks: &[BlockRateInput<'_>],
    layers: u16,
    byte_target: Option<usize>,
    strict: bool,
) -> Vec<LayerAllocation> {
    let hulls: Vec<Vec<HullPoint>> = blocks.iter().map(convex_hull).collect();

    // Merge hull steps in decreasing slope order.
    struct Step {
        block: usize,
        hull_idx: usize,
        slope: f64,
    }
    let mut steps: Vec<Step> = Vec::new();
    for (b, hull) in hulls.iter().enumerate() {
        for (i, p) in hull.iter().enumerate() {
            steps.push(Step {
                block: b,
                hull_idx: i,
                slope: p.slope,
            });
        }
    }
    steps.sort_by(|a, b| b.slope.partial_cmp(&a.slope).unwrap_or(std::cmp::Ordering::Equal));

    let total_rate: usize = hulls.iter().filter_map(|h| h.last().map(|p| p.rate)).sum();
    let final_target = byte_target.unwrap_or(total_rate).min(total_rate);

    let mut allocations: Vec<LayerAllocation> = blocks
        .iter()
        .map(|_| vec![0usize; layers as usize])
        .collect();

    for layer in 0..layers {
        let budget = if layer == layers - 1 {
            final_target
        } else {
            (final_target as u64 * (layer as u64 + 1) / layers as u64) as usize
        };

        // Walk the slope order; per block the steps appear in hull order,
        // so tracking the deepest admitted hull point per block gives the
        // cumulative pass count.
        let mut rate = 0usize;
        let mut chosen: Vec<usize> = vec![0; blocks.len()];
        let mut chosen_rate: Vec<usize> = vec![0; blocks.len()];
        for step in &steps {
            let hull = &hulls[step.block];
            let point = &hull[step.hull_idx];
            let delta = point.rate - chosen_rate[step.block];
            if rate + delta > budget {
                if strict {
                    continue;
                }
                // Non-strict: admit the crossing step, then stop taking
                // further ones for this layer.
                chosen[step.block] = point.passes;
                rate += delta;
                chosen_rate[step.block] = point.rate;
                break;
            }
            chosen[step.block] = point.passes;
            rate += delta;
            chosen_rate[step.block] = point.rate;
        }

        // No rate target: the final layer carries everything.
        if byte_target.is_none() && layer == layers - 1 {
            for (b, hull) in hulls.iter().enumerate() {
                chosen[b] = hull.last().map(|p| p.passes).unwrap_or(0);
            }
        }

        for (b, &c) in chosen.iter().enumerate() {
            // Layers are cumulative; never shrink an earlier assignment.
            allocations[b][layer as usize] = c.max(if layer == 0 {
                0
            } else {
                allocations[b][layer as usize - 1]
            });
        }
    }
    allocations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_plane_coder::{CodedPass, PassKind};

    fn block(pass_sizes: &[usize], dists: &[f64], initial: f64) -> CodedBlock {
        CodedBlock {
            passes: pass_sizes
                .iter()
                .zip(dists)
                .map(|(&len, &d)| CodedPass {
                    kind: PassKind::Cleanup,
                    data: vec![0u8; len],
                    distortion_after: d,
                })
                .collect(),
            num_planes: 4,
            initial_distortion: initial,
        }
    }

    #[test]
    fn no_target_puts_everything_in_last_layer() {
        let b = block(&[10, 10, 10], &[50.0, 20.0, 0.0], 100.0);
        let alloc = allocate_layers(
            &[BlockRateInput { coded: &b, weight: 1.0 }],
            3,
            None,
            false,
        );
        assert_eq!(alloc[0][2], 3);
        // Earlier layers are non-decreasing prefixes.
        assert!(alloc[0][0] <= alloc[0][1] && alloc[0][1] <= alloc[0][2]);
    }

    #[test]
    fn strict_target_never_exceeds_budget() {
        let b0 = block(&[10, 10, 10], &[40.0, 15.0, 0.0], 90.0);
        let b1 = block(&[8, 8], &[30.0, 0.0], 70.0);
        let inputs = [
            BlockRateInput { coded: &b0, weight: 1.0 },
            BlockRateInput { coded: &b1, weight: 1.0 },
        ];
        let alloc = allocate_layers(&inputs, 1, Some(20), true);
        let rate: usize = alloc
            .iter()
            .zip(&[&b0, &b1])
            .map(|(a, b)| b.passes[..a[0]].iter().map(|p| p.data.len()).sum::<usize>())
            .sum();
        assert!(rate <= 20, "strict rate {rate} exceeds 20");
    }

    #[test]
    fn higher_weight_block_wins_budget() {
        let b0 = block(&[10], &[0.0], 100.0);
        let b1 = block(&[10], &[0.0], 100.0);
        let inputs = [
            BlockRateInput { coded: &b0, weight: 16.0 },
            BlockRateInput { coded: &b1, weight: 1.0 },
        ];
        let alloc = allocate_layers(&inputs, 1, Some(10), true);
        assert_eq!(alloc[0][0], 1, "weighted block included");
        assert_eq!(alloc[1][0], 0, "light block dropped");
    }

    #[test]
    fn layers_are_monotone() {
        let b = block(
            &[30, 20, 15, 10, 5],
            &[500.0, 300.0, 150.0, 60.0, 0.0],
            900.0,
        );
        let alloc = allocate_layers(
            &[BlockRateInput { coded: &b, weight: 1.0 }],
            4,
            Some(80),
            false,
        );
        for w in alloc[0].windows(2) {
            assert!(w[0] <= w[1]);
        }
        assert_eq!(alloc[0][3], 5);
    }
}
