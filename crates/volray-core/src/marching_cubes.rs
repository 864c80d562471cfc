//! Marching cubes contour extraction.
//!
//! Used by the depth pre-pass: the contour of the volume at the configured
//! values is rasterized into a depth target that bounds the ray length.

#![allow(
    clippy::unreadable_literal,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss
)]

use std::collections::HashMap;

use glam::{DVec3, Vec3};

use crate::error::{Result, VolrayError};
use crate::image_data::ImageData;

/// Corner offsets of a cell; corner `i` has x in bit 0, y in bit 1, z in bit 2.
const CORNERS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [0, 1, 0],
    [1, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [0, 1, 1],
    [1, 1, 1],
];

/// Cell edges as `(corner a, corner b, axis)`, in the numbering used by [`MC_TRIS`].
const EDGES: [(usize, usize, usize); 12] = [
    (0, 1, 0),
    (2, 3, 0),
    (4, 5, 0),
    (6, 7, 0),
    (0, 2, 1),
    (1, 3, 1),
    (4, 6, 1),
    (5, 7, 1),
    (0, 4, 2),
    (1, 5, 2),
    (2, 6, 2),
    (3, 7, 2),
];

/// Triangle mesh produced by contouring.
#[derive(Debug, Clone, Default)]
pub struct ContourMesh {
    /// Vertex positions.
    pub vertices: Vec<Vec3>,
    /// Per-vertex normals, normalized.
    pub normals: Vec<Vec3>,
    /// Triangle indices.
    pub indices: Vec<u32>,
}

impl ContourMesh {
    /// Returns the number of triangles in the mesh.
    pub fn num_triangles(&self) -> usize {
        self.indices.len() / 3
    }

    /// Returns true if the mesh has no triangles.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    fn append(&mut self, other: ContourMesh) {
        let base = self.vertices.len() as u32;
        self.vertices.extend(other.vertices);
        self.normals.extend(other.normals);
        self.indices.extend(other.indices.into_iter().map(|i| i + base));
    }
}

/// Extracts the `isovalue` contour of a scalar field stored x fastest.
///
/// Vertices are in grid index space. Grids thinner than two samples on any
/// axis have no cells and produce an empty mesh.
pub fn extract_isosurface(field: &[f32], dims: [usize; 3], isovalue: f32) -> Result<ContourMesh> {
    let expected = dims.iter().product::<usize>();
    if field.len() != expected {
        return Err(VolrayError::SizeMismatch {
            expected,
            actual: field.len(),
        });
    }
    let mut mesh = ContourMesh::default();
    if dims.iter().any(|&d| d < 2) {
        return Ok(mesh);
    }

    let [nx, ny, _] = dims;
    let at = |x: usize, y: usize, z: usize| field[x + nx * (y + ny * z)] - isovalue;
    let mut edge_vertices: HashMap<usize, u32> = HashMap::new();
    let mut values = [0.0_f32; 8];
    let mut cell_edges = [0_u32; 12];

    for z in 0..dims[2] - 1 {
        for y in 0..dims[1] - 1 {
            for x in 0..dims[0] - 1 {
                let mut config = 0_usize;
                for (i, c) in CORNERS.iter().enumerate() {
                    values[i] = at(x + c[0], y + c[1], z + c[2]);
                    if values[i] < 0.0 {
                        config |= 1 << i;
                    }
                }
                if config == 0 || config == 255 {
                    continue;
                }

                for (e, &(a, b, axis)) in EDGES.iter().enumerate() {
                    let (va, vb) = (values[a], values[b]);
                    if (va < 0.0) == (vb < 0.0) {
                        continue;
                    }
                    let ca = CORNERS[a];
                    let (px, py, pz) = (x + ca[0], y + ca[1], z + ca[2]);
                    let key = ((pz * ny + py) * nx + px) * 3 + axis;
                    cell_edges[e] = *edge_vertices.entry(key).or_insert_with(|| {
                        let mut v = Vec3::new(px as f32, py as f32, pz as f32);
                        v[axis] += va / (va - vb);
                        mesh.vertices.push(v);
                        mesh.normals.push(Vec3::ZERO);
                        (mesh.vertices.len() - 1) as u32
                    });
                }

                let entry = MC_TRIS[config];
                let n_triangles = (entry & 0xF) as usize;
                let mut shift = 4;
                for _ in 0..n_triangles {
                    let mut tri = [0_u32; 3];
                    for slot in &mut tri {
                        *slot = cell_edges[((entry >> shift) & 0xF) as usize];
                        shift += 4;
                    }
                    mesh.indices.extend_from_slice(&tri);
                    accumulate_normal(&mut mesh, tri);
                }
            }
        }
    }

    for normal in &mut mesh.normals {
        *normal = normal.normalize_or_zero();
    }
    Ok(mesh)
}

/// Contours the first scalar component of `image` at every value in `values`.
///
/// Vertices are returned in the image's dataset coordinates.
pub fn contour_image(image: &ImageData, values: &[f64]) -> Result<ContourMesh> {
    let scalars = image.scalars().ok_or(VolrayError::MissingScalars)?;
    let dims = image.scalar_dimensions();
    let field: Vec<f32> = (0..scalars.tuples())
        .map(|t| scalars.value(t, 0) as f32)
        .collect();
    let center = if image.is_cell_data() { 0.5 } else { 0.0 };
    let to_dataset = image.index_to_physical_matrix();

    let mut merged = ContourMesh::default();
    for &value in values {
        let mut mesh = extract_isosurface(&field, dims, value as f32)?;
        for v in &mut mesh.vertices {
            let p = to_dataset.transform_point3(v.as_dvec3() + DVec3::splat(center));
            *v = p.as_vec3();
        }
        merged.append(mesh);
    }
    Ok(merged)
}

/// Accumulates the geometric normal of a triangle to its three vertices.
fn accumulate_normal(mesh: &mut ContourMesh, tri: [u32; 3]) {
    let va = mesh.vertices[tri[0] as usize];
    let vb = mesh.vertices[tri[1] as usize];
    let vc = mesh.vertices[tri[2] as usize];
    let n = (vc - vb).cross(va - vb);
    for i in tri {
        mesh.normals[i as usize] += n;
    }
}

/// Look-up table for triangle configurations (256 entries, one per cube configuration).
///
/// Each entry is a `u64` encoding:
/// - Bits `[3:0]`: Number of triangles (0-5)
/// - Bits `[7:4]`, `[11:8]`, ...: Edge indices (0-11) for each triangle vertex, 4 bits each
///
/// Table from the public-domain `MarchingCubeCpp` library.
#[rustfmt::skip]
static MC_TRIS: [u64; 256] = [
    0, 33793, 36945, 159668546,
    18961, 144771090, 5851666, 595283255635,
    20913, 67640146, 193993474, 655980856339,
    88782242, 736732689667, 797430812739, 194554754,
    26657, 104867330, 136709522, 298069416227,
    109224258, 8877909667, 318136408323, 1567994331701604,
    189884450, 350847647843, 559958167731, 3256298596865604,
    447393122899, 651646838401572, 2538311371089956, 737032694307,
    29329, 43484162, 91358498, 374810899075,
    158485010, 178117478419, 88675058979, 433581536604804,
    158486962, 649105605635, 4866906995, 3220959471609924,
    649165714851, 3184943915608436, 570691368417972, 595804498035,
    124295042, 431498018963, 508238522371, 91518530,
    318240155763, 291789778348404, 1830001131721892, 375363605923,
    777781811075, 1136111028516116, 3097834205243396, 508001629971,
    2663607373704004, 680242583802939237, 333380770766129845, 179746658,
    42545, 138437538, 93365810, 713842853011,
    73602098, 69575510115, 23964357683, 868078761575828,
    28681778, 713778574611, 250912709379, 2323825233181284,
    302080811955, 3184439127991172, 1694042660682596, 796909779811,
    176306722, 150327278147, 619854856867, 1005252473234484,
    211025400963, 36712706, 360743481544788, 150627258963,
    117482600995, 1024968212107700, 2535169275963444, 4734473194086550421,
    628107696687956, 9399128243, 5198438490361643573, 194220594,
    104474994, 566996932387, 427920028243, 2014821863433780,
    492093858627, 147361150235284, 2005882975110676, 9671606099636618005,
    777701008947, 3185463219618820, 482784926917540, 2900953068249785909,
    1754182023747364, 4274848857537943333, 13198752741767688709, 2015093490989156,
    591272318771, 2659758091419812, 1531044293118596, 298306479155,
    408509245114388, 210504348563, 9248164405801223541, 91321106,
    2660352816454484, 680170263324308757, 8333659837799955077, 482966828984116,
    4274926723105633605, 3184439197724820, 192104450, 15217,
    45937, 129205250, 129208402, 529245952323,
    169097138, 770695537027, 382310500883, 2838550742137652,
    122763026, 277045793139, 81608128403, 1991870397907988,
    362778151475, 2059003085103236, 2132572377842852, 655681091891,
    58419234, 239280858627, 529092143139, 1568257451898804,
    447235128115, 679678845236084, 2167161349491220, 1554184567314086709,
    165479003923, 1428768988226596, 977710670185060, 10550024711307499077,
    1305410032576132, 11779770265620358997, 333446212255967269, 978168444447012,
    162736434, 35596216627, 138295313843, 891861543990356,
    692616541075, 3151866750863876, 100103641866564, 6572336607016932133,
    215036012883, 726936420696196, 52433666, 82160664963,
    2588613720361524, 5802089162353039525, 214799000387, 144876322,
    668013605731, 110616894681956, 1601657732871812, 430945547955,
    3156382366321172, 7644494644932993285, 3928124806469601813, 3155990846772900,
    339991010498708, 10743689387941597493, 5103845475, 105070898,
    3928064910068824213, 156265010, 1305138421793636, 27185,
    195459938, 567044449971, 382447549283, 2175279159592324,
    443529919251, 195059004769796, 2165424908404116, 1554158691063110021,
    504228368803, 1436350466655236, 27584723588724, 1900945754488837749,
    122971970, 443829749251, 302601798803, 108558722,
    724700725875, 43570095105972, 2295263717447940, 2860446751369014181,
    2165106202149444, 69275726195, 2860543885641537797, 2165106320445780,
    2280890014640004, 11820349930268368933, 8721082628082003989, 127050770,
    503707084675, 122834978, 2538193642857604, 10129,
    801441490467, 2923200302876740, 1443359556281892, 2901063790822564949,
    2728339631923524, 7103874718248233397, 12775311047932294245, 95520290,
    2623783208098404, 1900908618382410757, 137742672547, 2323440239468964,
    362478212387, 727199575803140, 73425410, 34337,
    163101314, 668566030659, 801204361987, 73030562,
    591509145619, 162574594, 100608342969108, 5553,
    724147968595, 1436604830452292, 176259090, 42001,
    143955266, 2385, 18433, 0,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_data::{ScalarArray, ScalarData};

    #[test]
    fn test_constant_field_has_no_surface() {
        let field = vec![1.0; 27];
        assert!(extract_isosurface(&field, [3, 3, 3], 0.0).unwrap().is_empty());
        let field = vec![-1.0; 27];
        assert!(extract_isosurface(&field, [3, 3, 3], 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_single_crossing() {
        let mut field = vec![1.0_f32; 8];
        field[0] = -1.0;
        let mesh = extract_isosurface(&field, [2, 2, 2], 0.0).unwrap();
        assert_eq!(mesh.num_triangles(), 1);
        assert_eq!(mesh.vertices.len(), 3);
    }

    #[test]
    fn test_wrong_field_size() {
        assert!(extract_isosurface(&[0.0; 10], [3, 3, 3], 0.0).is_err());
    }

    #[test]
    fn test_flat_grid_is_empty() {
        assert!(extract_isosurface(&[0.0; 4], [2, 2, 1], 0.5).unwrap().is_empty());
    }

    #[test]
    fn test_sphere_vertices_shared_and_near_surface() {
        let n = 20_usize;
        let center = Vec3::splat(n as f32 / 2.0);
        let radius = n as f32 / 4.0;
        let mut field = vec![0.0_f32; n * n * n];
        for z in 0..n {
            for y in 0..n {
                for x in 0..n {
                    let p = Vec3::new(x as f32, y as f32, z as f32);
                    field[x + n * (y + n * z)] = (p - center).length() - radius;
                }
            }
        }
        let mesh = extract_isosurface(&field, [n, n, n], 0.0).unwrap();
        assert!(mesh.num_triangles() > 100);
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));
        // Shared edge vertices: a closed surface has far fewer vertices than corners.
        assert!(mesh.vertices.len() < mesh.indices.len());
        for v in &mesh.vertices {
            assert!(((*v - center).length() - radius).abs() < 1.0);
        }
        for normal in &mesh.normals {
            assert!((normal.length() - 1.0).abs() < 0.01);
        }
    }

    #[test]
    fn test_contour_image_maps_to_dataset_space() {
        let mut image = ImageData::new([2, 2, 2]).with_spacing(DVec3::splat(2.0));
        let mut values = vec![10.0_f32; 8];
        values[0] = 0.0;
        image
            .set_point_scalars(ScalarArray::new("s", 1, ScalarData::F32(values)).unwrap())
            .unwrap();
        let mesh = contour_image(&image, &[5.0, 7.5]).unwrap();
        assert_eq!(mesh.num_triangles(), 2);
        // Crossing at half the edge: index 0.5 scaled by spacing 2.
        assert!(mesh.vertices.iter().any(|v| (v.x - 1.0).abs() < 1e-5 && v.y == 0.0 && v.z == 0.0));
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));
    }
}
