//! Servers-of-happiness evaluation via maximum bipartite matching.
//!
//! Given which servers hold (or have accepted) which shares, the largest
//! matching between the share set and the server set is the number of
//! distinct servers that would need to fail simultaneously before the file
//! becomes unreconstructible from any single server's perspective. There is
//! exactly one evaluator in this crate; the selection loop never
//! approximates it with a greedy count.

use std::collections::HashMap;

/// The outcome of a happiness evaluation: the matching size, and which
/// share was matched to which server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Happiness {
    pub value: usize,
    pub matching: HashMap<u16, usize>,
}

/// Compute the maximum matching between shares (left) and the servers
/// that hold/accept them (right), using the Hopcroft-Karp algorithm.
///
/// `holders` maps each share number to the set of server indices that
/// currently hold (or have been allocated) that share.
pub fn evaluate(holders: &HashMap<u16, Vec<usize>>) -> Happiness {
    let shares: Vec<u16> = {
        let mut v: Vec<u16> = holders.keys().copied().collect();
        v.sort_unstable();
        v
    };
    let share_index: HashMap<u16, usize> =
        shares.iter().enumerate().map(|(i, &s)| (s, i)).collect();

    let adj: Vec<Vec<usize>> = shares
        .iter()
        .map(|s| holders.get(s).cloned().unwrap_or_default())
        .collect();

    let num_left = shares.len();
    const NIL: usize = usize::MAX;
    let mut match_left = vec![NIL; num_left];
    let mut match_right: HashMap<usize, usize> = HashMap::new();

    loop {
        // BFS layering from every unmatched left vertex.
        let mut dist = vec![usize::MAX; num_left];
        let mut queue = std::collections::VecDeque::new();
        for l in 0..num_left {
            if match_left[l] == NIL {
                dist[l] = 0;
                queue.push_back(l);
            }
        }
        let mut found_augmenting = false;
        while let Some(l) = queue.pop_front() {
            for &r in &adj[l] {
                if let Some(&l2) = match_right.get(&r) {
                    if dist[l2] == usize::MAX {
                        dist[l2] = dist[l] + 1;
                        queue.push_back(l2);
                    }
                } else {
                    found_augmenting = true;
                }
            }
        }
        if !found_augmenting {
            break;
        }

        let mut visited = vec![false; num_left];
        for l in 0..num_left {
            if match_left[l] == NIL && !visited[l] {
                try_augment(l, &adj, &mut match_right, &mut match_left, &dist, &mut visited);
            }
        }
    }

    let mut matching = HashMap::new();
    for (l, &r) in match_left.iter().enumerate() {
        if r != NIL {
            matching.insert(shares[l], r);
        }
    }

    let _ = share_index;
    Happiness {
        value: matching.len(),
        matching,
    }
}

#[allow(clippy::too_many_arguments)]
fn try_augment(
    l: usize,
    adj: &[Vec<usize>],
    match_right: &mut HashMap<usize, usize>,
    match_left: &mut [usize],
    dist: &[usize],
    visited: &mut [bool],
) -> bool {
    visited[l] = true;
    for &r in &adj[l] {
        let go = match match_right.get(&r) {
            None => true,
            Some(&l2) if dist[l2] == dist[l] + 1 && !visited[l2] => {
                try_augment(l2, adj, match_right, match_left, dist, visited)
            }
            _ => false,
        };
        if go {
            match_right.insert(r, l);
            match_left[l] = r;
            return true;
        }
    }
    false
}
