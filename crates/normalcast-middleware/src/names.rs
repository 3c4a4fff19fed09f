//! Graph name resolution.
//!
//! Topics, parameters and node diagnostic names share one hierarchical,
//! `/`-separated namespace.  A name starting with `/` is absolute; anything
//! else is relative and resolves under the namespace of the node that uses it.

/// Collapse repeated separators and strip a trailing one.
///
/// The root namespace stays `/`; a relative name stays relative.
pub fn clean(name: &str) -> String {
    let absolute = name.starts_with('/');
    let joined = name
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    if absolute || joined.is_empty() {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Join `name` onto `namespace`.
pub fn append(namespace: &str, name: &str) -> String {
    clean(&format!("{namespace}/{name}"))
}

/// Resolve `name` against `namespace`.
///
/// Absolute names are returned cleaned; relative names are appended to the
/// namespace, which is itself treated as absolute.
pub fn resolve(namespace: &str, name: &str) -> String {
    if name.starts_with('/') {
        clean(name)
    } else {
        append(&format!("/{namespace}"), name)
    }
}

/// Split a resolved name into its non-empty segments.
pub fn segments(name: &str) -> impl Iterator<Item = &str> {
    name.split('/').filter(|segment| !segment.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_collapses_separators() {
        assert_eq!(clean("//lidar///front/"), "/lidar/front");
        assert_eq!(clean("lidar//front"), "lidar/front");
        assert_eq!(clean(""), "/");
        assert_eq!(clean("/"), "/");
    }

    #[test]
    fn append_under_root() {
        assert_eq!(append("/", "NormalAugmenter"), "/NormalAugmenter");
        assert_eq!(append("", "NormalAugmenter"), "/NormalAugmenter");
    }

    #[test]
    fn append_under_namespace() {
        assert_eq!(append("/robot/lidar", "NormalAugmenter"), "/robot/lidar/NormalAugmenter");
        assert_eq!(append("/robot/", "/point_cloud"), "/robot/point_cloud");
    }

    #[test]
    fn resolve_relative_name() {
        assert_eq!(resolve("/robot", "point_cloud"), "/robot/point_cloud");
        assert_eq!(resolve("robot", "normals/search_radius"), "/robot/normals/search_radius");
        assert_eq!(resolve("/", "point_cloud"), "/point_cloud");
    }

    #[test]
    fn resolve_absolute_name_ignores_namespace() {
        assert_eq!(resolve("/robot", "/global/point_cloud"), "/global/point_cloud");
    }

    #[test]
    fn segments_skip_empty_parts() {
        let parts: Vec<&str> = segments("/robot/normals/search_radius").collect();
        assert_eq!(parts, vec!["robot", "normals", "search_radius"]);
    }
}
