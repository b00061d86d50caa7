//! Row-parallel iteration over image buffers.
//!
//! With the `rayon` feature rows are processed on the global thread pool;
//! otherwise they run sequentially. Results are identical either way since
//! every row is written independently.

/// Calls `f(row_index, row)` for every `row_len`-sized chunk of `out`.
pub(crate) fn for_each_row<F>(out: &mut [f32], row_len: usize, f: F)
where
    F: Fn(usize, &mut [f32]) + Send + Sync,
{
    if row_len == 0 {
        return;
    }
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        out.par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(row, chunk)| f(row, chunk));
    }
    #[cfg(not(feature = "rayon"))]
    {
        out.chunks_mut(row_len)
            .enumerate()
            .for_each(|(row, chunk)| f(row, chunk));
    }
}
