//! Mesh input/output in binary STL
use super::mesh::Mesh;
use crate::error::Error;
use nalgebra::Vector3;
use std::io::{BufReader, BufWriter, Read, Write};

const HEADER: &[u8] = b"This is a binary STL file exported by isomesh";
static_assertions::const_assert!(HEADER.len() <= 80);

impl Mesh {
    /// Writes a binary STL to the given output
    ///
    /// Per-triangle normals are written as zeros, which every STL consumer
    /// treats as "compute from the vertices".
    pub fn write_stl<F: Write>(&self, out: &mut F) -> Result<(), Error> {
        // Lots of small writes, so buffer them
        let mut out = BufWriter::new(out);
        out.write_all(HEADER)?;
        out.write_all(&[0u8; 80 - HEADER.len()])?;
        out.write_all(&(self.triangles.len() as u32).to_le_bytes())?;
        for t in &self.triangles {
            for _ in 0..3 {
                out.write_all(&0f32.to_le_bytes())?; // normal
            }
            for v in t {
                for p in &self.vertices[*v as usize] {
                    out.write_all(&p.to_le_bytes())?;
                }
            }
            out.write_all(&0u16.to_le_bytes())?; // attribute byte count
        }
        Ok(())
    }

    /// Reads a binary STL, returning a triangle soup
    ///
    /// STL carries no connectivity, so the result is one `[a, b, c]`
    /// position triple per triangle; normals and attributes are ignored.
    pub fn read_stl<F: Read>(
        input: &mut F,
    ) -> Result<Vec<[Vector3<f32>; 3]>, Error> {
        let mut input = BufReader::new(input);
        let mut header = [0u8; 80];
        input.read_exact(&mut header)?;
        let mut count = [0u8; 4];
        input.read_exact(&mut count)?;
        let count = u32::from_le_bytes(count);

        let mut out = Vec::with_capacity(count as usize);
        let mut tri = [0u8; 50]; // normal + 3 vertices + attributes
        for _ in 0..count {
            input.read_exact(&mut tri)?;
            let vert = |i: usize| {
                let at = |j: usize| {
                    f32::from_le_bytes(tri[j..j + 4].try_into().unwrap())
                };
                // Skip the 12-byte normal at the start of the record
                let base = 12 + i * 12;
                Vector3::new(at(base), at(base + 4), at(base + 8))
            };
            out.push([vert(0), vert(1), vert(2)]);
        }
        Ok(out)
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mesh = Mesh {
            vertices: vec![
                Vector3::zeros(), // sentinel
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(0.0, 1.0, 0.0),
                Vector3::new(0.0, 0.0, 1.0),
            ],
            triangles: vec![
                Vector3::new(1, 2, 3),
                Vector3::new(1, 3, 4),
                Vector3::new(1, 4, 2),
                Vector3::new(2, 4, 3),
            ],
        };
        let mut buf = vec![];
        mesh.write_stl(&mut buf).unwrap();
        assert_eq!(buf.len(), 84 + 4 * 50);

        let tris = Mesh::read_stl(&mut buf.as_slice()).unwrap();
        assert_eq!(tris.len(), mesh.triangles.len());
        for (t, soup) in mesh.triangles.iter().zip(&tris) {
            for i in 0..3 {
                assert_eq!(mesh.vertices[t[i] as usize], soup[i]);
            }
        }
    }

    #[test]
    fn test_empty_mesh() {
        let mesh = Mesh::new();
        let mut buf = vec![];
        mesh.write_stl(&mut buf).unwrap();
        assert_eq!(buf.len(), 84);
        let tris = Mesh::read_stl(&mut buf.as_slice()).unwrap();
        assert!(tris.is_empty());
    }
}
