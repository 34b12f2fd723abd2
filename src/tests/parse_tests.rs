#[cfg(test)]
mod parse_tests {
    use crate::parse::*;
    use crate::process::NicheError;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use geo::{Area, Intersects, Point};
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_file(path: &Path, content: &str) {
        let mut f = File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    fn ascii_grid(value: impl Fn(usize, usize) -> f64, nrows: usize, ncols: usize) -> String {
        let mut s = format!(
            "ncols {}\nnrows {}\nxllcorner 0.0\nyllcorner 0.0\ncellsize 1.0\nNODATA_value -9999\n",
            ncols, nrows
        );
        for r in 0..nrows {
            let row: Vec<String> = (0..ncols).map(|c| value(r, c).to_string()).collect();
            s.push_str(&row.join(" "));
            s.push('\n');
        }
        s
    }

    #[test]
    fn test_occurrences_dedup_and_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("occ.csv");
        write_file(
            &path,
            "species,lon,lat\n\
             O. mellicolor,-84.1,10.2\n\
             O. mediorufa,-70.5,-12.0\n\
             O. mellicolor,-84.1,10.2\n\
             O. mellicolor,-83.9,9.8\n\
             O. mediorufa,not_a_number,-12.0\n\
             ,-70.0,-11.0\n",
        );
        let (points, groups) = parse_occurrence_file(&path).unwrap();
        assert_eq!(groups, vec!["O. mellicolor".to_string(), "O. mediorufa".to_string()]);
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].longitude, -84.1);
        assert_eq!(points[2].group, "O. mellicolor");
    }

    #[test]
    fn test_occurrences_tab_and_gzip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("occ.tsv.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder
            .write_all(b"group\tlongitude\tlatitude\nA\t1.0\t2.0\nB\t3.0\t4.0\n")
            .unwrap();
        encoder.finish().unwrap();

        let (points, groups) = parse_occurrence_file(&path).unwrap();
        assert_eq!(groups, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(points[1].latitude, 4.0);
    }

    #[test]
    fn test_occurrences_txt_is_comma_separated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("occ.txt");
        write_file(&path, "species,x,y\nA,1.0,2.0\nB,3.0,4.0\n");
        let (points, groups) = parse_occurrence_file(&path).unwrap();
        assert_eq!(groups, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(points[0].longitude, 1.0);
        assert_eq!(points[1].latitude, 4.0);
    }

    #[test]
    fn test_occurrences_missing_column() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("occ.csv");
        write_file(&path, "group,lon\nA,1.0\n");
        assert!(matches!(parse_occurrence_file(&path), Err(NicheError::Parse(_))));
    }

    #[test]
    fn test_group_order() {
        let available = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        assert_eq!(
            parse_group_order("C, A", &available).unwrap(),
            vec!["C".to_string(), "A".to_string()]
        );
        assert!(parse_group_order("A,D", &available).is_err());
        assert!(parse_group_order("A,A", &available).is_err());
    }

    #[test]
    fn test_ascii_grid_nodata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bio1.asc");
        write_file(
            &path,
            "ncols 3\nnrows 2\nxllcenter 0.5\nyllcenter 0.5\ncellsize 1\nNODATA_value -9999\n1 2 3\n4 -9999 6\n",
        );
        let grid = parse_ascii_grid(&path).unwrap();
        assert_eq!((grid.nrows, grid.ncols), (2, 3));
        assert_eq!(grid.west, 0.0);
        assert_eq!(grid.north(), 2.0);
        assert_eq!(grid.values[[0, 2]], 3.0);
        assert!(grid.values[[1, 1]].is_nan());
    }

    #[test]
    fn test_ascii_grid_wrong_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.asc");
        write_file(&path, "ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2 3\n");
        assert!(matches!(parse_ascii_grid(&path), Err(NicheError::Parse(_))));
    }

    #[test]
    fn test_ascii_grid_zero_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.asc");
        write_file(&path, "ncols 0\nnrows 4\nxllcorner 0\nyllcorner 0\ncellsize 1\n");
        assert!(matches!(parse_ascii_grid(&path), Err(NicheError::Parse(_))));
        write_file(&path, "ncols 4\nnrows 0\nxllcorner 0\nyllcorner 0\ncellsize 1\n");
        assert!(matches!(parse_ascii_grid(&path), Err(NicheError::Parse(_))));
    }

    #[test]
    fn test_env_stack_natural_order() {
        let dir = tempdir().unwrap();
        for (name, offset) in [("bio10", 10.0), ("bio2", 2.0), ("bio1", 1.0)] {
            write_file(
                &dir.path().join(format!("{}.asc", name)),
                &ascii_grid(|r, c| offset + (r * 4 + c) as f64, 4, 4),
            );
        }
        write_file(&dir.path().join("notes.txt"), "ignored");

        let stack = load_env_stack(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(stack.band_names, vec!["bio1", "bio2", "bio10"]);
        assert_eq!(stack.n_bands(), 3);
        assert_eq!(stack.north, 4.0);
        // Top-left cell of each band.
        assert_eq!(stack.values_at(0.5, 3.5), Some(vec![1.0, 2.0, 10.0]));
    }

    #[test]
    fn test_env_stack_rejects_misaligned_bands() {
        let dir = tempdir().unwrap();
        write_file(&dir.path().join("bio1.asc"), &ascii_grid(|_, _| 1.0, 4, 4));
        write_file(&dir.path().join("bio2.asc"), &ascii_grid(|_, _| 1.0, 3, 4));
        assert!(matches!(
            load_env_stack(dir.path().to_str().unwrap()),
            Err(NicheError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_env_stack_empty_directory() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            load_env_stack(dir.path().to_str().unwrap()),
            Err(NicheError::Config(_))
        ));
    }

    #[test]
    fn test_mask_feature_collection_union() {
        let content = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {"name": "west"},
                 "geometry": {"type": "Polygon", "coordinates": [[[0,0],[2,0],[2,2],[0,2],[0,0]]]}},
                {"type": "Feature", "properties": {"name": "east"},
                 "geometry": {"type": "Polygon", "coordinates": [[[1,0],[3,0],[3,2],[1,2],[1,0]]]}},
                {"type": "Feature", "properties": {},
                 "geometry": {"type": "Point", "coordinates": [9, 9]}}
            ]
        }"#;
        let mask = parse_mask_str(content).unwrap();
        assert!((mask.unsigned_area() - 6.0).abs() < 1e-9);
        assert!(mask.intersects(&Point::new(2.5, 1.0)));
        assert!(!mask.intersects(&Point::new(9.0, 9.0)));
    }

    #[test]
    fn test_mask_single_feature() {
        let content = r#"{"type": "Feature", "properties": null,
            "geometry": {"type": "MultiPolygon", "coordinates": [
                [[[0,0],[1,0],[1,1],[0,1],[0,0]]],
                [[[4,4],[6,4],[6,6],[4,6],[4,4]]]
            ]}}"#;
        let mask = parse_mask_str(content).unwrap();
        assert!((mask.unsigned_area() - 5.0).abs() < 1e-9);
        assert!(mask.intersects(&Point::new(5.0, 5.0)));
        assert!(!mask.intersects(&Point::new(2.5, 2.5)));

        let bare = r#"{"type": "Polygon", "coordinates": [[[0,0],[3,0],[3,3],[0,3],[0,0]]]}"#;
        assert!((parse_mask_str(bare).unwrap().unsigned_area() - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_mask_without_polygons() {
        let content = r#"{"type": "Point", "coordinates": [1, 2]}"#;
        assert!(matches!(parse_mask_str(content), Err(NicheError::GeoJson(_))));
        assert!(matches!(parse_mask_str("not json"), Err(NicheError::GeoJson(_))));
    }
}
