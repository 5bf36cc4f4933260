use crate::error::Error;
use kube::Resource;

/// Declare `parent` as the controlling owner of `child`, so the garbage collector removes the
/// child together with the parent. A reference to the same parent is never added twice.
pub fn bind_owner<P, C>(parent: &P, child: &mut C) -> Result<(), Error>
where
    P: Resource<DynamicType = ()>,
    C: Resource,
{
    let oref = parent
        .controller_owner_ref(&())
        .ok_or_else(|| Error::MissingObjectKey(".metadata.uid"))?;
    let owners = child.meta_mut().owner_references.get_or_insert_with(Vec::new);
    if !owners.iter().any(|o| o.uid == oref.uid) {
        owners.push(oref);
    }
    Ok(())
}
