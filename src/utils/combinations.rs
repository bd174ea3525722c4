/// Every `k`-element combination of `items`, preserving relative order, in
/// lexicographic index order (`[a,b,c]`, k=2 gives `ab, ac, bc`).
pub fn combinations<T: Clone>(
    items: &[T],
    k: usize,
) -> Vec<Vec<T>> {
    let n = items.len();
    if k == 0 || k > n {
        return vec![];
    }

    let mut out = Vec::new();
    let mut indices: Vec<usize> = (0..k).collect();
    loop {
        out.push(indices.iter().map(|&i| items[i].clone()).collect());

        // rightmost index that can still move forward
        let mut i = k;
        loop {
            if i == 0 {
                return out;
            }
            i -= 1;
            if indices[i] != i + n - k {
                break;
            }
        }
        indices[i] += 1;
        for j in i + 1..k {
            indices[j] = indices[j - 1] + 1;
        }
    }
}

/// Server strings tried by one reconnection sweep: the full list first, then
/// every smaller combination down to single servers.
pub fn sweep_order(servers: &[String]) -> Vec<String> {
    (1..=servers.len())
        .rev()
        .flat_map(|size| combinations(servers, size))
        .map(|combo| combo.join(","))
        .collect()
}
