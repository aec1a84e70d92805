/// Split `items` into consecutive chunks with the given sizes. Used by
/// reshaping, where the sizes come from the child counts of one tree
/// level. The caller is responsible for the sizes summing to the item
/// count; leftovers are dropped.
pub fn split_items<T>(items : Vec<T>, sizes : &[usize]) -> Vec<Vec<T>> {
    let mut iter = items.into_iter();
    sizes.iter()
         .map(|size| iter.by_ref().take(*size).collect())
         .collect()
}
